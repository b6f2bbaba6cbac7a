pub mod datadog_agent;
pub mod extended_daemonset;
