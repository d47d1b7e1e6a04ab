//! Genie CNI entry point
//!
//! Reads the CNI request from the environment and stdin, runs it, and
//! writes the result or a CNI error to stdout. Logs go to stderr.

use std::env;
use std::io::{self, Read, Write};

use tracing::warn;

use genie_cni::cluster::{ClusterClient, KubeClusterClient};
use genie_cni::config::NetworkConfig;
use genie_cni::error::GenieError;
use genie_cni::genie::Genie;
use genie_cni::invoke::ExecPlugins;
use genie_cni::logging;
use genie_cni::ranking::{CadvisorRanking, RankingService};
use genie_cni::registry::BackendRegistry;
use genie_cni::resolver::ConfigResolver;
use genie_cni::result::VersionResult;
use genie_cni::selector::SelectionContext;
use genie_cni::workload::{K8sArgs, WorkloadIdentity};

/// Maximum size of network config input (1 MB should be more than enough)
const MAX_INPUT_SIZE: u64 = 1024 * 1024;

/// CNI Spec version reported by VERSION
const CNI_VERSION: &str = "1.0.0";

/// Supported CNI versions
const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

fn main() {
    logging::init();

    if let Err(e) = run() {
        let stdout = io::stdout();
        let _ = write_error(&mut stdout.lock(), &e);
        std::process::exit(1);
    }
}

/// Write `e` as a CNI error object
///
/// Runtimes read the error from stdout, the same stream a result goes to.
fn write_error<W: Write>(out: &mut W, e: &GenieError) -> io::Result<()> {
    let error_output = serde_json::json!({
        "cniVersion": CNI_VERSION,
        "code": e.code() as u32,
        "msg": e.to_string(),
        "details": e.details()
    });
    let line = serde_json::to_string(&error_output).unwrap_or_else(|_| {
        format!(
            r#"{{"cniVersion":"{}","code":{},"msg":"{}"}}"#,
            CNI_VERSION,
            e.code() as u32,
            e
        )
    });
    writeln!(out, "{}", line)?;
    out.flush()
}

fn run() -> Result<(), GenieError> {
    let command = env::var("CNI_COMMAND")
        .map_err(|_| GenieError::InvalidArgs("CNI_COMMAND not set".to_string()))?;

    // Read network config from stdin (with size limit to prevent OOM)
    let mut input = String::new();
    io::stdin()
        .take(MAX_INPUT_SIZE)
        .read_to_string(&mut input)
        .map_err(|e| GenieError::io("failed to read stdin", e))?;

    match command.as_str() {
        "ADD" => cmd_add(&input),
        "DEL" => cmd_del(&input),
        "CHECK" => cmd_check(&input),
        "VERSION" => cmd_version(),
        _ => {
            // Truncate command for safety in error message (avoid log injection)
            let safe_command: String = command
                .chars()
                .take(32)
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            Err(GenieError::InvalidArgs(format!(
                "unknown CNI_COMMAND: {}",
                safe_command
            )))
        }
    }
}

fn load_config(input: &str) -> Result<NetworkConfig, GenieError> {
    let config = NetworkConfig::load(input)?;
    if !SUPPORTED_VERSIONS.contains(&config.cni_version.as_str()) {
        return Err(GenieError::IncompatibleVersion(config.cni_version));
    }
    Ok(config)
}

fn required_env(name: &str) -> Result<String, GenieError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(GenieError::InvalidArgs(format!("{} not set", name))),
    }
}

/// Build the workload identity from the CNI environment
///
/// DEL may arrive after the network namespace is gone, so it only needs the
/// container ID.
fn workload_from_env(strict: bool) -> Result<WorkloadIdentity, GenieError> {
    let container_id = required_env("CNI_CONTAINERID")?;
    let (netns, ifname) = if strict {
        (required_env("CNI_NETNS")?, required_env("CNI_IFNAME")?)
    } else {
        (
            env::var("CNI_NETNS").unwrap_or_default(),
            env::var("CNI_IFNAME").unwrap_or_default(),
        )
    };
    let args = K8sArgs::parse(&env::var("CNI_ARGS").unwrap_or_default())?;

    Ok(WorkloadIdentity::new(container_id, netns, ifname, args))
}

/// Run `f` with an orchestrator wired up for `workload`
fn with_genie<T, F>(config: &NetworkConfig, workload: &WorkloadIdentity, f: F) -> Result<T, GenieError>
where
    F: FnOnce(&Genie<'_>, &SelectionContext) -> Result<T, GenieError>,
{
    let cni_path = env::var("CNI_PATH").ok();
    let registry = BackendRegistry::from_config(config, cni_path.as_deref());
    let executor = ExecPlugins::new(registry.search_path());
    let resolver = ConfigResolver::new(registry);

    // Cluster access and ranking only make sense for pods
    let (cluster, ranking) = if workload.pod.is_some() {
        let cluster = match KubeClusterClient::from_config(config) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "cluster access unavailable");
                None
            }
        };
        let ranking = match CadvisorRanking::new(config.cadvisor_url()) {
            Ok(ranking) => Some(ranking),
            Err(e) => {
                warn!(error = %e, "ranking service unavailable");
                None
            }
        };
        (cluster, ranking)
    } else {
        (None, None)
    };

    let cluster_ref = cluster.as_ref().map(|c| c as &dyn ClusterClient);
    let ranking_ref = ranking.as_ref().map(|r| r as &dyn RankingService);

    let ctx = SelectionContext::gather(workload, config, cluster_ref)?;
    let genie = Genie::new(resolver, &executor, cluster_ref, ranking_ref);
    f(&genie, &ctx)
}

/// Handle ADD command - attach through every selected backend
fn cmd_add(input: &str) -> Result<(), GenieError> {
    let config = load_config(input)?;
    let workload = workload_from_env(true)?;

    let mut result = with_genie(&config, &workload, |genie, ctx| {
        genie.add(&workload, ctx)?.into_result()
    })?;
    result.cni_version = config.cni_version.clone();

    let output = serde_json::to_string(&result)
        .map_err(|e| GenieError::decode("failed to serialize result", e))?;
    println!("{}", output);

    Ok(())
}

/// Handle DEL command - detach from every selected backend
fn cmd_del(input: &str) -> Result<(), GenieError> {
    let config = load_config(input)?;
    let workload = workload_from_env(false)?;

    // DEL outputs nothing on success
    with_genie(&config, &workload, |genie, ctx| genie.del(&workload, ctx))
}

/// Handle CHECK command - validate the configuration
fn cmd_check(input: &str) -> Result<(), GenieError> {
    load_config(input)?;
    Ok(())
}

/// Handle VERSION command - report supported CNI versions
fn cmd_version() -> Result<(), GenieError> {
    let result = VersionResult {
        cni_version: CNI_VERSION.to_string(),
        supported_versions: SUPPORTED_VERSIONS.iter().map(|s| s.to_string()).collect(),
    };

    let output = serde_json::to_string(&result)
        .map_err(|e| GenieError::decode("failed to serialize version", e))?;
    println!("{}", output);

    Ok(())
}
