use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::{Metadata, MetadataCommand, PackageId};

/// A package and the crates it must never reach, directly or transitively.
struct Boundary {
    package: &'static str,
    forbidden: &'static [&'static str],
}

/// The mapping core and the shared contracts stay pure: no transport, no
/// storage driver, no async runtime.
const BOUNDARIES: &[Boundary] = &[
    Boundary {
        package: "tablegate-mapping",
        forbidden: &[
            "axum",
            "reqwest",
            "sqlx",
            "tablegate-auth",
            "tablegate-gateway",
            "tablegate-storage",
            "tokio",
        ],
    },
    Boundary {
        package: "tablegate-contracts",
        forbidden: &[
            "axum",
            "sqlx",
            "tablegate-mapping",
            "tablegate-storage",
            "tokio",
        ],
    },
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let mut failed = false;
    for boundary in BOUNDARIES {
        let violations = violations(&metadata, boundary)?;
        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                boundary.package,
                boundary.forbidden.join(", ")
            );
        } else {
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                boundary.package,
                violations.join(", ")
            );
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn violations(metadata: &Metadata, boundary: &Boundary) -> Result<Vec<String>> {
    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let root = metadata
        .packages
        .iter()
        .find(|p| p.name == boundary.package)
        .with_context(|| format!("package `{}` not found in workspace", boundary.package))?;

    let id_to_name: HashMap<&PackageId, &str> = metadata
        .packages
        .iter()
        .map(|p| (&p.id, p.name.as_str()))
        .collect();

    let adjacency: HashMap<&PackageId, Vec<&PackageId>> = resolve
        .nodes
        .iter()
        .map(|node| (&node.id, node.deps.iter().map(|dep| &dep.pkg).collect()))
        .collect();

    let mut visited = HashSet::from([&root.id]);
    let mut queue = VecDeque::from([&root.id]);
    let mut found = Vec::new();

    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(current) else {
            continue;
        };

        for dep in deps.iter().copied() {
            if !visited.insert(dep) {
                continue;
            }

            if let Some(name) = id_to_name.get(dep)
                && boundary.forbidden.contains(name)
            {
                found.push((*name).to_string());
            }

            queue.push_back(dep);
        }
    }

    found.sort();
    found.dedup();
    Ok(found)
}
