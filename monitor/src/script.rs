//! Launching the operator-supplied script on cluster events.
//!
//! The command is a shell-style string with placeholders that are
//! substituted with the current cluster context before execution. The
//! child is bounded by the configured script timeout and killed on expiry.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, info};

use sqlgate_common::event::MonitorEvent;
use sqlgate_common::status::{SERVER_JOINED, SERVER_MASTER, SERVER_RUNNING, SERVER_SLAVE};

use crate::server::MonitorServer;
use crate::settings::MonitorSettings;

/// Split a shell-style command string into arguments, honoring single and
/// double quotes. Quotes are stripped; backslash escapes the next character
/// outside single quotes.
pub(crate) fn tokenize(command: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some(_) => {
                if c == '"' {
                    quote = None;
                } else if c == '\\' {
                    match chars.next() {
                        Some(escaped) => current.push(escaped),
                        None => return Err("trailing backslash".to_string()),
                    }
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => match chars.next() {
                    Some(escaped) => {
                        current.push(escaped);
                        in_token = true;
                    }
                    None => return Err("trailing backslash".to_string()),
                },
                c if c.is_whitespace() => {
                    if in_token {
                        args.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}

/// Comma-separated `[addr]:port` list of servers whose live status matches
/// `status_mask` (0 matches every server). With `credentials`, entries take
/// the form `user:password@[addr]:port` using the per-server monitor user
/// when set.
fn node_names(
    servers: &[MonitorServer],
    settings: &MonitorSettings,
    status_mask: u64,
    credentials: bool,
) -> String {
    let mut entries = Vec::new();
    for ms in servers {
        if status_mask != 0 && ms.backend.status() & status_mask == 0 {
            continue;
        }
        if credentials {
            let (user, password) = if !ms.backend.monitor_user().is_empty() {
                (
                    ms.backend.monitor_user().to_string(),
                    ms.backend.monitor_password().expose().as_str().to_string(),
                )
            } else {
                (
                    settings.conn.username.clone(),
                    settings.conn.password.clone(),
                )
            };
            entries.push(format!(
                "{}:{}@{}",
                user,
                password,
                ms.backend.address_string()
            ));
        } else {
            entries.push(ms.backend.address_string());
        }
    }
    entries.join(",")
}

/// The parent of `target` in the replication tree: the server whose
/// node id equals the target's master id.
fn find_parent_node<'a>(
    servers: &'a [MonitorServer],
    target: &MonitorServer,
) -> Option<&'a MonitorServer> {
    let master_id = target.backend.master_id();
    if master_id <= 0 {
        return None;
    }
    servers.iter().find(|ms| ms.backend.node_id() == master_id)
}

/// Comma-separated children of `parent` in the replication tree.
fn child_nodes(servers: &[MonitorServer], parent: &MonitorServer) -> String {
    let node_id = parent.backend.node_id();
    if node_id <= 0 {
        return String::new();
    }
    servers
        .iter()
        .filter(|ms| ms.backend.master_id() == node_id)
        .map(|ms| ms.backend.address_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn substitute(
    args: &mut [String],
    servers: &[MonitorServer],
    settings: &MonitorSettings,
    initiator: &MonitorServer,
    event: MonitorEvent,
) {
    let replacements: [(&str, String); 10] = [
        ("$INITIATOR", initiator.backend.address_string()),
        (
            "$PARENT",
            find_parent_node(servers, initiator)
                .map(|p| p.backend.address_string())
                .unwrap_or_default(),
        ),
        ("$CHILDREN", child_nodes(servers, initiator)),
        ("$EVENT", event.name().to_string()),
        (
            "$CREDENTIALS",
            node_names(servers, settings, 0, true),
        ),
        (
            "$NODELIST",
            node_names(servers, settings, SERVER_RUNNING, false),
        ),
        ("$LIST", node_names(servers, settings, 0, false)),
        (
            "$MASTERLIST",
            node_names(servers, settings, SERVER_MASTER, false),
        ),
        (
            "$SLAVELIST",
            node_names(servers, settings, SERVER_SLAVE, false),
        ),
        (
            "$SYNCEDLIST",
            node_names(servers, settings, SERVER_JOINED, false),
        ),
    ];

    for arg in args.iter_mut() {
        if !arg.contains('$') {
            continue;
        }
        for (placeholder, value) in &replacements {
            if arg.contains(placeholder) {
                *arg = arg.replace(placeholder, value);
            }
        }
    }
}

async fn execute(args: &[String], script_timeout: Duration, event: MonitorEvent) -> i32 {
    let mut child = match Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            error!(
                "Failed to execute script '{}' on server state change event '{}': {}",
                args[0],
                event.name(),
                err
            );
            return -1;
        }
    };

    match timeout(script_timeout, child.wait()).await {
        Ok(Ok(status)) => status.code().unwrap_or(-1),
        Ok(Err(err)) => {
            error!("Failed to wait for script '{}': {}", args[0], err);
            -1
        }
        Err(_) => {
            let _ = child.kill().await;
            error!(
                "Script '{}' did not finish within {} seconds on event '{}' and was killed",
                args[0],
                script_timeout.as_secs(),
                event.name()
            );
            -1
        }
    }
}

/// Substitute placeholders and run the configured script for one event.
/// Returns the script's exit code, -1 on spawn failure or timeout.
pub(crate) async fn launch(
    settings: &MonitorSettings,
    servers: &[MonitorServer],
    initiator_index: usize,
    event: MonitorEvent,
) -> i32 {
    let mut args = match tokenize(&settings.script) {
        Ok(args) if !args.is_empty() => args,
        Ok(_) => {
            error!("Monitor script is configured but empty after parsing");
            return -1;
        }
        Err(err) => {
            error!("Failed to parse monitor script '{}': {}", settings.script, err);
            return -1;
        }
    };

    let initiator = &servers[initiator_index];
    substitute(&mut args, servers, settings, initiator, event);

    let code = execute(&args, settings.script_timeout(), event).await;
    if code == 0 {
        info!(
            "Executed monitor script '{}' on event '{}'",
            args.join(" "),
            event.name()
        );
    } else if code > 0 {
        error!(
            "Script '{}' returned {} on event '{}'",
            args[0],
            code,
            event.name()
        );
        metrics::counter!("monitor.script_failures").increment(1);
    } else {
        metrics::counter!("monitor.script_failures").increment(1);
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{MonitorServer, ServerSlot};
    use sqlgate_registry::{BackendServer, DiskSpaceLimits, ServerConfig};
    use std::sync::Arc;

    fn monitor_server(name: &str, address: &str, port: u16, status: u64) -> MonitorServer {
        let backend = Arc::new(BackendServer::new(ServerConfig {
            name: name.to_string(),
            address: address.to_string(),
            port,
            protocol: "mariadb".to_string(),
            monitor_user: String::new(),
            monitor_password: String::new(),
            disk_space_limits: Default::default(),
        }));
        backend.assign_status(status);
        MonitorServer::new(ServerSlot::new(backend), DiskSpaceLimits::new())
    }

    #[test]
    fn test_tokenize_plain() {
        assert_eq!(
            tokenize("/usr/bin/notify $EVENT $INITIATOR").unwrap(),
            vec!["/usr/bin/notify", "$EVENT", "$INITIATOR"]
        );
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize(r#"/bin/sh -c 'echo "hello world"'"#).unwrap(),
            vec!["/bin/sh", "-c", r#"echo "hello world""#]
        );
        assert_eq!(tokenize(r#"cmd "a b" c"#).unwrap(), vec!["cmd", "a b", "c"]);
    }

    #[test]
    fn test_tokenize_escapes_and_errors() {
        assert_eq!(tokenize(r"cmd a\ b").unwrap(), vec!["cmd", "a b"]);
        assert!(tokenize("cmd 'unterminated").is_err());
        assert!(tokenize("cmd trailing\\").is_err());
    }

    #[test]
    fn test_substitution() {
        let a = monitor_server("a", "10.0.0.1", 3306, SERVER_RUNNING | SERVER_MASTER);
        let b = monitor_server("b", "10.0.0.2", 3306, SERVER_RUNNING | SERVER_SLAVE);
        let c = monitor_server("c", "10.0.0.3", 3306, 0);
        a.backend.set_node_id(1);
        b.backend.set_node_id(2);
        b.backend.set_master_id(1);
        c.backend.set_master_id(1);
        let servers = vec![a, b, c];
        let settings = MonitorSettings::default();

        let mut args: Vec<String> = [
            "$EVENT",
            "$INITIATOR",
            "$PARENT",
            "$CHILDREN",
            "$NODELIST",
            "$LIST",
            "$MASTERLIST",
            "$SLAVELIST",
            "$SYNCEDLIST",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        // b is the initiator; its parent is a, and a's children are b and c.
        substitute(&mut args, &servers, &settings, &servers[1], MonitorEvent::SlaveDown);
        assert_eq!(
            args,
            vec![
                "slave_down",
                "[10.0.0.2]:3306",
                "[10.0.0.1]:3306",
                "",
                "[10.0.0.1]:3306,[10.0.0.2]:3306",
                "[10.0.0.1]:3306,[10.0.0.2]:3306,[10.0.0.3]:3306",
                "[10.0.0.1]:3306",
                "[10.0.0.2]:3306",
                "",
            ]
        );

        let mut args = vec!["$CHILDREN".to_string()];
        substitute(&mut args, &servers, &settings, &servers[0], MonitorEvent::MasterDown);
        assert_eq!(args, vec!["[10.0.0.2]:3306,[10.0.0.3]:3306"]);
    }

    #[test]
    fn test_credentials_substitution() {
        let a = monitor_server("a", "10.0.0.1", 3306, SERVER_RUNNING);
        let servers = vec![a];
        let mut settings = MonitorSettings::default();
        settings.conn.username = "monuser".to_string();
        settings.conn.password = "monpw".to_string();

        let mut args = vec!["$CREDENTIALS".to_string()];
        substitute(&mut args, &servers, &settings, &servers[0], MonitorEvent::ServerUp);
        assert_eq!(args, vec!["monuser:monpw@[10.0.0.1]:3306"]);
    }

    #[tokio::test]
    async fn test_execute_exit_codes() {
        let ok = execute(
            &["/bin/true".to_string()],
            Duration::from_secs(5),
            MonitorEvent::ServerUp,
        )
        .await;
        assert_eq!(ok, 0);

        let fail = execute(
            &["/bin/false".to_string()],
            Duration::from_secs(5),
            MonitorEvent::ServerUp,
        )
        .await;
        assert_eq!(fail, 1);

        let missing = execute(
            &["/no/such/script".to_string()],
            Duration::from_secs(5),
            MonitorEvent::ServerUp,
        )
        .await;
        assert_eq!(missing, -1);
    }

    #[tokio::test]
    async fn test_execute_timeout_kills() {
        let started = std::time::Instant::now();
        let code = execute(
            &["/bin/sleep".to_string(), "10".to_string()],
            Duration::from_millis(200),
            MonitorEvent::ServerUp,
        )
        .await;
        assert_eq!(code, -1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
