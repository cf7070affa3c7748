/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-service readiness predicates and one-time bootstrap steps.
//!
//! Predicates only look at cluster state; checking that the processes
//! themselves are alive is left to the caller, which does it before
//! every poll. Client errors that mean "still coming up" turn into
//! [`Readiness::NotYetBecause`]; anything else is fatal.

use std::time::Duration;

use serde_json::Value;
use serde_json::json;

use crate::client::ClientError;
use crate::client::ClusterClient;
use crate::client::CreateOptions;
use crate::error::ClusterError;
use crate::wait::Readiness;

/// Error codes returned while an orchid cannot be reached yet.
const ORCHID_UNREACHABLE_CODES: [i64; 2] = [100, 105];

const HTTP_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

const OPERATIONS_USER: &str = "application_operations";

fn is_transient(err: &ClientError) -> bool {
    matches!(err, ClientError::Unavailable(_))
        || err
            .code()
            .is_some_and(|code| ORCHID_UNREACHABLE_CODES.contains(&code))
}

/// Map transient client errors to "not yet", and keep the rest fatal.
fn settle(result: Result<Readiness, ClientError>) -> Result<Readiness, ClusterError> {
    match result {
        Ok(readiness) => Ok(readiness),
        Err(err) if is_transient(&err) => Ok(Readiness::because(err.to_string())),
        Err(err) => Err(err.into()),
    }
}

/// A cell has quorum once it accepts a write of the dynamic config.
/// Any failure means not yet.
pub async fn master_quorum(client: &dyn ClusterClient, dynamic_config: &Value) -> Readiness {
    match client.set("//sys/@config", dynamic_config.clone()).await {
        Ok(()) => Readiness::Ready,
        Err(err) => Readiness::because(err.to_string()),
    }
}

/// Whether the primary cell lists `cell_tag` among its registered
/// secondary cells.
pub async fn secondary_cell_registered(
    primary: &dyn ClusterClient,
    cell_tag: u16,
) -> Result<Readiness, ClusterError> {
    settle(
        async {
            let tags = primary.get("//sys/@registered_master_cell_tags").await?;
            let registered = tags
                .as_array()
                .is_some_and(|tags| tags.iter().any(|tag| tag.as_u64() == Some(cell_tag.into())));
            Ok(if registered {
                Readiness::Ready
            } else {
                Readiness::because(format!("cell {} is not registered yet", cell_tag))
            })
        }
        .await,
    )
}

/// Clocks are ready once they hand out a timestamp.
pub async fn clock_quorum(client: &dyn ClusterClient) -> Readiness {
    match client.generate_timestamp().await {
        Ok(_) => Readiness::Ready,
        Err(err) => Readiness::because(err.to_string()),
    }
}

/// Exactly `expected` nodes are registered, all of them online.
pub async fn nodes_online(
    client: &dyn ClusterClient,
    expected: usize,
) -> Result<Readiness, ClusterError> {
    settle(
        async {
            let nodes = client.list("//sys/nodes", &["state".to_string()]).await?;
            let online = nodes
                .iter()
                .filter(|node| node.attribute("state") == Some(&json!("online")))
                .count();
            Ok(if nodes.len() == expected && online == expected {
                Readiness::Ready
            } else {
                Readiness::because(format!(
                    "{} of {} nodes are online ({} registered)",
                    online,
                    expected,
                    nodes.len()
                ))
            })
        }
        .await,
    )
}

/// Point the orchid at `orchid` to fast retries and read
/// `<orchid>/<component>/connected`.
async fn orchid_connected(
    client: &dyn ClusterClient,
    orchid: &str,
    component: &str,
) -> Result<bool, ClientError> {
    client
        .set(&format!("{}/@retry_backoff_time", orchid), json!(100))
        .await?;
    let connected = client
        .get(&format!("{}/{}/connected", orchid, component))
        .await?;
    Ok(connected.as_bool().unwrap_or(false))
}

fn scheduler_node_online(node: &Value) -> bool {
    let online = |key: &str| node.get(key) == Some(&json!("online"));
    if node.get("state").is_some() {
        online("state")
    } else {
        online("scheduler_state") && online("master_state")
    }
}

/// All schedulers are registered, one of them is connected to this
/// cluster's primary cell and, when `expected_nodes` is given, it sees
/// that many nodes online.
pub async fn schedulers_ready(
    client: &dyn ClusterClient,
    expected: usize,
    expected_nodes: Option<usize>,
) -> Result<Readiness, ClusterError> {
    settle(
        async {
            let instances = client.list("//sys/scheduler/instances", &[]).await?;
            if instances.len() != expected {
                return Ok(Readiness::because(format!(
                    "{} of {} schedulers are registered",
                    instances.len(),
                    expected
                )));
            }

            let mut active = None;
            for instance in &instances {
                let orchid = format!("//sys/scheduler/instances/{}/orchid", instance.name);
                match orchid_connected(client, &orchid, "scheduler").await {
                    Ok(true) => active = Some(orchid),
                    Ok(false) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
            let Some(orchid) = active else {
                return Ok(Readiness::because("no active scheduler found"));
            };

            let cell_ids = async {
                let master = client.get("//sys/@cell_id").await?;
                let scheduler = client
                    .get(&format!(
                        "{}/config/cluster_connection/primary_master/cell_id",
                        orchid
                    ))
                    .await?;
                Ok::<_, ClientError>((master, scheduler))
            }
            .await;
            match cell_ids {
                Ok((master, scheduler)) if master != scheduler => {
                    return Ok(Readiness::because(format!(
                        "incorrect scheduler connected, its cell_id {} does not match \
                         master cell {}",
                        scheduler, master
                    )));
                }
                Ok(_) => {}
                Err(err) if err.is_not_found() => {
                    return Ok(Readiness::because(format!(
                        "failed to request primary master cell id from master and scheduler: {}",
                        err
                    )));
                }
                Err(err) => return Err(err),
            }

            if let Some(expected_nodes) = expected_nodes {
                let nodes = client.get(&format!("{}/scheduler/nodes", orchid)).await?;
                let nodes: Vec<&Value> = nodes
                    .as_object()
                    .map(|nodes| nodes.values().collect())
                    .unwrap_or_default();
                let online = nodes.iter().filter(|node| scheduler_node_online(node)).count();
                if nodes.len() != expected_nodes || online != expected_nodes {
                    return Ok(Readiness::because(format!(
                        "scheduler sees {} of {} nodes online",
                        online, expected_nodes
                    )));
                }
            }
            Ok(Readiness::Ready)
        }
        .await,
    )
}

/// All controller agents are registered and connected.
pub async fn controller_agents_ready(
    client: &dyn ClusterClient,
    expected: usize,
) -> Result<Readiness, ClusterError> {
    settle(
        async {
            let instances = client
                .list("//sys/controller_agents/instances", &[])
                .await?;
            if instances.len() != expected {
                return Ok(Readiness::because(format!(
                    "only {} agents are registered",
                    instances.len()
                )));
            }

            let mut active = 0;
            for instance in &instances {
                let orchid = format!("//sys/controller_agents/instances/{}/orchid", instance.name);
                match orchid_connected(client, &orchid, "controller_agent").await {
                    Ok(true) => active += 1,
                    Ok(false) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
            Ok(if active < expected {
                Readiness::because(format!("only {} agents are active", active))
            } else {
                Readiness::Ready
            })
        }
        .await,
    )
}

/// Exactly `expected` rpc proxies are registered and alive.
pub async fn rpc_proxies_ready(
    client: &dyn ClusterClient,
    expected: usize,
) -> Result<Readiness, ClusterError> {
    settle(
        async {
            let proxies = client.get("//sys/rpc_proxies").await?;
            let proxies = proxies.as_object().cloned().unwrap_or_default();
            let alive = proxies
                .values()
                .filter(|proxy| proxy.get("alive").is_some())
                .count();
            Ok((proxies.len() == expected && alive == expected).into())
        }
        .await,
    )
}

/// Every http proxy answers `GET /api` on the loopback address with a
/// success status.
pub async fn http_proxies_ready(ports: &[u16]) -> Readiness {
    let client = match reqwest::Client::builder()
        .timeout(HTTP_CHECK_TIMEOUT)
        .no_proxy()
        .build()
    {
        Ok(client) => client,
        Err(err) => return Readiness::because(format!("failed to build http client: {}", err)),
    };
    for &port in ports {
        let url = format!("http://127.0.0.1:{}/api", port);
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                return Readiness::because(format!(
                    "http proxy on port {} answered with status {}",
                    port,
                    response.status()
                ));
            }
            Err(err) if err.is_timeout() => {
                return Readiness::because(format!("http proxy on port {} did not answer", port));
            }
            Err(err) => {
                return Readiness::because(format!("http proxy on port {}: {}", port, err));
            }
        }
    }
    Readiness::Ready
}

/// Abort the transaction holding a scheduler lock left over from a
/// previous run.
pub async fn abort_stale_scheduler_lock(client: &dyn ClusterClient) -> Result<(), ClusterError> {
    match client.get("//sys/scheduler/lock/@locks/0/transaction_id").await {
        Ok(Value::String(transaction_id)) if !transaction_id.is_empty() => {
            client.abort_transaction(&transaction_id).await?;
            tracing::info!("previous scheduler transaction was aborted");
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Create the default pool tree the schedulers expect.
pub async fn prepare_pool_trees(client: &dyn ClusterClient) -> Result<(), ClusterError> {
    client
        .create(
            "map_node",
            Some("//sys/pool_trees/default".to_string()),
            CreateOptions {
                recursive: true,
                ignore_existing: true,
                attributes: None,
            },
        )
        .await?;
    client
        .set("//sys/pool_trees/@default_tree", json!("default"))
        .await?;
    client
        .set(
            "//sys/pool_trees/default/@max_ephemeral_pools_per_user",
            json!(5),
        )
        .await?;
    if !client.exists("//sys/pools").await? {
        client
            .link("//sys/pool_trees/default", "//sys/pools", true)
            .await?;
    }
    Ok(())
}

/// One-time setup once the masters are up: the operations user, and
/// the proxy address used to build operation URLs.
pub async fn bootstrap_cluster(
    client: &dyn ClusterClient,
    http_proxy_address: Option<&str>,
) -> Result<(), ClusterError> {
    let user = format!("//sys/users/{}", OPERATIONS_USER);
    if !client.exists(&user).await? {
        client
            .create(
                "user",
                None,
                CreateOptions {
                    attributes: Some(json!({"name": OPERATIONS_USER})),
                    ..Default::default()
                },
            )
            .await?;
        client.add_member(OPERATIONS_USER, "superusers").await?;
    }
    if let Some(address) = http_proxy_address {
        client
            .set("//sys/@local_mode_proxy_address", json!(address))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use mockall::predicate::eq;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::client::MockClusterClient;
    use crate::test_utils::InMemoryCluster;

    #[tokio::test]
    async fn test_master_quorum() {
        let mut client = MockClusterClient::new();
        let mut attempts = 0;
        client
            .expect_set()
            .with(eq("//sys/@config"), eq(json!({"enable_safe_mode": false})))
            .times(2)
            .returning(move |_, _| {
                attempts += 1;
                if attempts == 1 {
                    Err(ClientError::Unavailable("no leader".to_string()))
                } else {
                    Ok(())
                }
            });
        let config = json!({"enable_safe_mode": false});
        assert_eq!(
            master_quorum(&client, &config).await,
            Readiness::because("cluster unavailable: no leader")
        );
        assert_eq!(master_quorum(&client, &config).await, Readiness::Ready);
    }

    #[tokio::test]
    async fn test_nodes_online() {
        let cluster = InMemoryCluster::new();
        cluster.seed("//sys/nodes/localhost:1/@state", json!("online"));
        cluster.seed("//sys/nodes/localhost:2/@state", json!("registered"));
        assert_eq!(
            nodes_online(&cluster, 2).await.unwrap(),
            Readiness::because("1 of 2 nodes are online (2 registered)")
        );
        cluster.seed("//sys/nodes/localhost:2/@state", json!("online"));
        assert!(nodes_online(&cluster, 2).await.unwrap().is_ready());
        assert!(!nodes_online(&cluster, 3).await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_fatal_and_transient_errors() {
        let mut client = MockClusterClient::new();
        let mut calls = 0;
        client.expect_list().returning(move |_, _| {
            calls += 1;
            match calls {
                1 => Err(ClientError::Response {
                    code: 105,
                    message: "orchid unreachable".to_string(),
                }),
                _ => Err(ClientError::Response {
                    code: 500,
                    message: "access denied".to_string(),
                }),
            }
        });
        assert!(matches!(
            nodes_online(&client, 1).await.unwrap(),
            Readiness::NotYetBecause(_)
        ));
        assert!(matches!(
            nodes_online(&client, 1).await,
            Err(ClusterError::Client(ClientError::Response { code: 500, .. }))
        ));
    }

    fn seed_scheduler(cluster: &InMemoryCluster, name: &str, connected: bool, cell_id: &str) {
        let orchid = format!("//sys/scheduler/instances/{}/orchid", name);
        cluster.seed(&format!("{}/scheduler/connected", orchid), json!(connected));
        cluster.seed(
            &format!("{}/config/cluster_connection/primary_master/cell_id", orchid),
            json!(cell_id),
        );
    }

    #[tokio::test]
    async fn test_schedulers_ready() {
        let cluster = InMemoryCluster::new();
        cluster.seed("//sys/@cell_id", json!("1-2-3-4"));
        cluster.seed("//sys/scheduler/instances/host:1", json!({}));
        assert_eq!(
            schedulers_ready(&cluster, 2, None).await.unwrap(),
            Readiness::because("1 of 2 schedulers are registered")
        );

        // The second instance has no orchid yet.
        cluster.seed("//sys/scheduler/instances/host:2", json!({}));
        seed_scheduler(&cluster, "host:1", false, "1-2-3-4");
        assert_eq!(
            schedulers_ready(&cluster, 2, None).await.unwrap(),
            Readiness::because("no active scheduler found")
        );

        seed_scheduler(&cluster, "host:1", true, "9-9-9-9");
        assert!(matches!(
            schedulers_ready(&cluster, 2, None).await.unwrap(),
            Readiness::NotYetBecause(cause) if cause.starts_with("incorrect scheduler connected")
        ));

        seed_scheduler(&cluster, "host:1", true, "1-2-3-4");
        assert!(schedulers_ready(&cluster, 2, None).await.unwrap().is_ready());
        assert_eq!(
            cluster.value("//sys/scheduler/instances/host:1/orchid/@retry_backoff_time"),
            Some(json!(100))
        );

        let nodes = "//sys/scheduler/instances/host:1/orchid/scheduler/nodes";
        cluster.seed(
            &format!("{}/a", nodes),
            json!({"scheduler_state": "online", "master_state": "online"}),
        );
        cluster.seed(&format!("{}/b", nodes), json!({"state": "offline"}));
        assert!(!schedulers_ready(&cluster, 2, Some(2)).await.unwrap().is_ready());
        cluster.seed(&format!("{}/b", nodes), json!({"state": "online"}));
        assert!(schedulers_ready(&cluster, 2, Some(2)).await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_controller_agents_ready() {
        let cluster = InMemoryCluster::new();
        cluster.seed("//sys/controller_agents/instances/host:1", json!({}));
        assert!(controller_agents_ready(&cluster, 1).await.is_ok());
        assert_eq!(
            controller_agents_ready(&cluster, 1).await.unwrap(),
            Readiness::because("only 0 agents are active")
        );
        cluster.seed(
            "//sys/controller_agents/instances/host:1/orchid/controller_agent/connected",
            json!(true),
        );
        assert!(controller_agents_ready(&cluster, 1).await.unwrap().is_ready());
        assert_eq!(
            controller_agents_ready(&cluster, 2).await.unwrap(),
            Readiness::because("only 1 agents are registered")
        );
    }

    #[tokio::test]
    async fn test_rpc_proxies_and_secondary_cells() {
        let cluster = InMemoryCluster::new();
        cluster.seed("//sys/rpc_proxies/localhost:9013/alive", json!({}));
        cluster.seed("//sys/rpc_proxies/localhost:9014/@banned", json!(false));
        assert!(!rpc_proxies_ready(&cluster, 2).await.unwrap().is_ready());
        cluster.seed("//sys/rpc_proxies/localhost:9014/alive", json!({}));
        assert!(rpc_proxies_ready(&cluster, 2).await.unwrap().is_ready());

        cluster.seed("//sys/@registered_master_cell_tags", json!([11]));
        assert!(secondary_cell_registered(&cluster, 11).await.unwrap().is_ready());
        assert!(!secondary_cell_registered(&cluster, 12).await.unwrap().is_ready());
    }

    async fn serve_once(listener: TcpListener, status: &'static str) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 1024];
        let read = socket.read(&mut request).await.unwrap();
        assert!(request[..read].starts_with(b"GET /api HTTP/1.1\r\n"));
        socket
            .write_all(format!("HTTP/1.1 {}\r\nContent-Length: 0\r\n\r\n", status).as_bytes())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_http_proxies_ready() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, "200 OK"));
        assert_eq!(http_proxies_ready(&[port]).await, Readiness::Ready);
        server.await.unwrap();

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, "503 Service Unavailable"));
        assert!(matches!(
            http_proxies_ready(&[port]).await,
            Readiness::NotYetBecause(cause) if cause.contains("status 503")
        ));
        server.await.unwrap();

        // Nothing listens on a port that was just released.
        let port = {
            let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!http_proxies_ready(&[port]).await.is_ready());

        // A listener that never answers times out.
        let silent = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = silent.local_addr().unwrap().port();
        assert!(matches!(
            http_proxies_ready(&[port]).await,
            Readiness::NotYetBecause(cause) if cause.contains("did not answer")
        ));
    }

    #[tokio::test]
    async fn test_scheduler_lock_and_pool_trees() {
        let cluster = InMemoryCluster::new();
        abort_stale_scheduler_lock(&cluster).await.unwrap();
        assert!(cluster.aborted_transactions().is_empty());

        cluster.seed(
            "//sys/scheduler/lock/@locks/0/transaction_id",
            json!("0-1-2-3"),
        );
        abort_stale_scheduler_lock(&cluster).await.unwrap();
        assert_eq!(cluster.aborted_transactions(), ["0-1-2-3"]);

        prepare_pool_trees(&cluster).await.unwrap();
        assert_eq!(
            cluster.value("//sys/pool_trees/@default_tree"),
            Some(json!("default"))
        );
        assert_eq!(
            cluster.value("//sys/pools/@target_path"),
            Some(json!("//sys/pool_trees/default"))
        );
        // Running it again keeps the existing tree.
        prepare_pool_trees(&cluster).await.unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_cluster() {
        let cluster = InMemoryCluster::new();
        bootstrap_cluster(&cluster, Some("localhost:8000")).await.unwrap();
        assert!(cluster.exists("//sys/users/application_operations").await.unwrap());
        assert_eq!(
            cluster.members(),
            [("application_operations".to_string(), "superusers".to_string())]
        );
        assert_eq!(
            cluster.value("//sys/@local_mode_proxy_address"),
            Some(json!("localhost:8000"))
        );

        // The user exists now, so membership is not requested again.
        bootstrap_cluster(&cluster, None).await.unwrap();
        assert_eq!(cluster.members().len(), 1);
    }
}
