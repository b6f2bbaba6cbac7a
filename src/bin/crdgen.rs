//! Print the CustomResourceDefinitions this operator serves or consumes.
//!
//! Without arguments the definitions go to stdout as one multi-document YAML
//! stream, ready for `kubectl apply -f -`. With `--out-dir` each definition is
//! written to `<group>_<plural>.yaml`, the layout of a `config/crd/bases` tree.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

use datadog_operator::crd::{datadog_agent::DatadogAgent, extended_daemonset::ExtendedDaemonSet};

#[derive(Parser, Debug)]
#[command(name = "crdgen", about = "Render the operator's CRDs as YAML")]
struct Args {
    /// Write one file per CRD into this directory instead of stdout.
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

fn file_name(crd: &CustomResourceDefinition) -> String {
    format!("{}_{}.yaml", crd.spec.group, crd.spec.names.plural)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let crds = [DatadogAgent::crd(), ExtendedDaemonSet::crd()];

    let Some(dir) = args.out_dir else {
        for crd in &crds {
            print!("---\n{}", serde_yaml::to_string(crd)?);
        }
        return Ok(());
    };

    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    for crd in &crds {
        let path = dir.join(file_name(crd));
        let yaml = serde_yaml::to_string(crd)?;
        std::fs::write(&path, format!("---\n{yaml}"))
            .with_context(|| format!("writing {}", path.display()))?;
        eprintln!("wrote {}", path.display());
    }
    Ok(())
}
