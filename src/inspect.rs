//! The `cnat list` inspection tool
//!
//! Lists At resources in a given namespace (or all namespaces), printing
//! name, schedule, command, phase, and age. Any connection or listing
//! failure propagates out and exits the process non-zero.

use std::path::Path;

use chrono::Utc;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, Resource, ResourceExt};

use crate::crd::At;

/// Build a client, optionally from an alternate kubeconfig file
pub async fn build_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await?,
    };
    Ok(Client::try_from(config)?)
}

/// List At resources and print them as a table
///
/// An empty `namespace` means all namespaces.
pub async fn run_list(client: Client, namespace: Option<&str>) -> anyhow::Result<()> {
    let api: Api<At> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    let ats = api.list(&ListParams::default()).await?;
    if ats.items.is_empty() {
        match namespace {
            Some(ns) => println!("No At resources found in namespace {ns:?}"),
            None => println!("No At resources found"),
        }
        return Ok(());
    }

    println!(
        "{:<24} {:<22} {:<32} {:<8} {:<6}",
        "NAME", "SCHEDULE", "COMMAND", "PHASE", "AGE"
    );
    let now = Utc::now();
    for at in &ats.items {
        let age = at
            .meta()
            .creation_timestamp
            .as_ref()
            .map(|t| format_age(now - t.0))
            .unwrap_or_else(|| "<unknown>".to_string());
        println!(
            "{:<24} {:<22} {:<32} {:<8} {:<6}",
            at.name_any(),
            at.spec.schedule,
            at.spec.command,
            at.phase(),
            age
        );
    }
    Ok(())
}

/// Render an age the way kubectl does: the largest whole unit only
fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86_400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn age_uses_the_largest_whole_unit() {
        assert_eq!(format_age(Duration::seconds(5)), "5s");
        assert_eq!(format_age(Duration::seconds(59)), "59s");
        assert_eq!(format_age(Duration::seconds(180)), "3m");
        assert_eq!(format_age(Duration::seconds(7200)), "2h");
        assert_eq!(format_age(Duration::days(4)), "4d");
    }

    #[test]
    fn clock_skew_never_prints_a_negative_age() {
        assert_eq!(format_age(Duration::seconds(-30)), "0s");
    }
}
