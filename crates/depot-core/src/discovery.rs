use crate::context::Context;
use depot_adapter::{wrap, AdapterError, ContainerHost, StorageAdapter, WrapOptions};
use depot_schema::ContainerId;
use serde_json::json;
use tracing::{debug, info, warn};

/// Everything found on a host, split by role.
pub struct Discovery {
    /// Indexed storage containers.
    pub adapters: Vec<Box<dyn StorageAdapter>>,
    /// Container drained by deposits.
    pub input: Option<Box<dyn StorageAdapter>>,
    /// Container receiving withdrawals.
    pub output: Option<ContainerId>,
    pub unavailable: Vec<AdapterError>,
}

/// Wrap every container the host exposes. A container that cannot be
/// wrapped is reported and skipped; the rest still register.
pub fn discover(ctx: &Context, host: &dyn ContainerHost) -> Discovery {
    let storage = &ctx.config.storage;
    let mut found = Discovery {
        adapters: Vec::new(),
        input: None,
        output: None,
        unavailable: Vec::new(),
    };

    for id in host.container_ids() {
        if ctx.config.is_ignored(&id) {
            debug!("ignoring {id}");
            continue;
        }

        if storage.output.as_ref() == Some(&id) {
            match host.open(&id) {
                Ok(_) => found.output = Some(id),
                Err(e) => {
                    let err = AdapterError::Unavailable {
                        id: id.clone(),
                        reason: e.to_string(),
                    };
                    report_unavailable(ctx, &err);
                    found.unavailable.push(err);
                }
            }
            continue;
        }

        let options = WrapOptions {
            priority: ctx.config.priority_for(&id),
        };
        match wrap(host, &id, &options) {
            Ok(adapter) if storage.input.as_ref() == Some(&id) => {
                info!("{id} is the input container ({})", adapter.kind());
                found.input = Some(adapter);
            }
            Ok(adapter) => {
                info!(
                    "registered {id} as {} adapter (priority {})",
                    adapter.kind(),
                    adapter.priority()
                );
                ctx.bus.publish(
                    "adapter.registered",
                    json!({
                        "id": id,
                        "kind": adapter.kind(),
                        "priority": adapter.priority(),
                    }),
                );
                found.adapters.push(adapter);
            }
            Err(err) => {
                report_unavailable(ctx, &err);
                found.unavailable.push(err);
            }
        }
    }

    if let Some(input) = &storage.input {
        if found.input.is_none() {
            warn!("configured input container {input} was not found");
        }
    }
    if let Some(output) = &storage.output {
        if found.output.is_none() {
            warn!("configured output container {output} was not found");
        }
    }
    info!(
        "discovery finished: {} adapters, {} unavailable",
        found.adapters.len(),
        found.unavailable.len()
    );
    found
}

fn report_unavailable(ctx: &Context, err: &AdapterError) {
    warn!("{err}");
    let id = match err {
        AdapterError::Unavailable { id, .. }
        | AdapterError::Unsupported { id, .. }
        | AdapterError::Native { id, .. } => id.to_string(),
    };
    ctx.bus.publish(
        "adapter.unavailable",
        json!({ "id": id, "reason": err.to_string() }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_adapter::{AdapterKind, ContainerSpec, MemoryHost};
    use depot_schema::ServiceConfig;

    fn config() -> ServiceConfig {
        depot_schema::parse_config_str(
            r#"
[storage]
input = "input"
output = "output"
ignore = ["trash"]

[adapters."drawer"]
priority = 9
"#,
        )
        .unwrap()
    }

    #[test]
    fn splits_roles_and_wraps_by_type() {
        let host = MemoryHost::new();
        host.add_container("input", ContainerSpec::chest(9));
        host.add_container("output", ContainerSpec::chest(9));
        host.add_container("trash", ContainerSpec::chest(9));
        host.add_container("chest", ContainerSpec::chest(27));
        host.add_container(
            "drawer",
            ContainerSpec::upgradeable("functionalstorage:oak_1", 1, 4),
        );
        host.add_container("me", ContainerSpec::network(10_000));

        let ctx = Context::new(config()).unwrap();
        let found = discover(&ctx, &host);

        assert!(found.input.is_some());
        assert_eq!(found.output, Some(ContainerId::new("output")));
        let kinds: Vec<(String, AdapterKind)> = found
            .adapters
            .iter()
            .map(|a| (a.id().to_string(), a.kind()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("chest".to_owned(), AdapterKind::Generic),
                ("drawer".to_owned(), AdapterKind::Upgradeable),
                ("me".to_owned(), AdapterKind::Network),
            ]
        );
        assert_eq!(found.adapters[1].priority(), 9);

        let registered = ctx
            .bus
            .recent_events(100)
            .into_iter()
            .filter(|e| e.topic == "adapter.registered")
            .count();
        assert_eq!(registered, 3);
    }

    #[test]
    fn detached_container_is_skipped_not_fatal() {
        let host = MemoryHost::new();
        host.add_container("good", ContainerSpec::chest(9));
        host.add_container("gone", ContainerSpec::chest(9));
        host.detach("gone");

        let ctx = Context::new(ServiceConfig::default()).unwrap();
        let found = discover(&ctx, &host);
        assert_eq!(found.adapters.len(), 1);
        assert_eq!(found.unavailable.len(), 1);
        assert!(matches!(
            &found.unavailable[0],
            AdapterError::Unavailable { id, .. } if id.as_str() == "gone"
        ));
        let events = ctx.bus.recent_events(100);
        assert!(events.iter().any(|e| e.topic == "adapter.unavailable"
            && e.payload["id"] == "gone"));
    }
}
