use std::path::PathBuf;

use anyhow::Context;
use dispatch_protocol::{DispatchConfig, Role};

const DEFAULT_CONFIG_PATH: &str = "./config/dispatch.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Args {
    pub config_path: PathBuf,
    pub role: Role,
    pub server_url: Option<String>,
    pub fallback_url: Option<String>,
    pub room: Option<String>,
    pub name: Option<String>,
    /// Roster entry a driver reports status for
    pub employee_id: Option<String>,
}

impl Args {
    /// Fold command-line overrides into the loaded configuration.
    pub fn apply(&self, config: &mut DispatchConfig) {
        if let Some(url) = &self.server_url {
            config.signaling.primary_url = url.clone();
        }
        if let Some(url) = &self.fallback_url {
            config.signaling.fallback_url = Some(url.clone());
        }
        if let Some(room) = &self.room {
            config.session.default_room = room.clone();
        }
        if let Some(name) = &self.name {
            config.session.display_name = name.clone();
        }
    }
}

fn print_help() {
    println!("dispatch-client - emergency dispatch video call client");
    println!();
    println!("USAGE:");
    println!("    dispatch-client [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>              Config file [default: {DEFAULT_CONFIG_PATH}]");
    println!("    --role <ROLE>                caller, agent or driver [default: caller]");
    println!("    --server-url <URL>           Signaling server WebSocket URL");
    println!("    --fallback-url <URL>         Signaling URL tried when the primary is down");
    println!("    --room <ROOM>                Room joined by agents");
    println!("    --name <NAME>                Display name attached to calls");
    println!("    --employee-id <ID>           Driver roster entry to report status for");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
}

pub fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    parse_from(&args)
}

/// Parse an argv-style list; `args[0]` is the program name.
pub fn parse_from(args: &[String]) -> anyhow::Result<Args> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut role = Role::Caller;
    let mut server_url = None;
    let mut fallback_url = None;
    let mut room = None;
    let mut name = None;
    let mut employee_id = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("dispatch-client {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => {
                i += 1;
                config_path = PathBuf::from(args.get(i).context("Missing --config value")?);
            }
            "--role" => {
                i += 1;
                role = args
                    .get(i)
                    .context("Missing --role value")?
                    .parse()
                    .map_err(anyhow::Error::msg)
                    .context("Invalid --role value")?;
            }
            "--server-url" => {
                i += 1;
                server_url = Some(args.get(i).context("Missing --server-url value")?.clone());
            }
            "--fallback-url" => {
                i += 1;
                fallback_url = Some(args.get(i).context("Missing --fallback-url value")?.clone());
            }
            "--room" => {
                i += 1;
                room = Some(args.get(i).context("Missing --room value")?.clone());
            }
            "--name" => {
                i += 1;
                name = Some(args.get(i).context("Missing --name value")?.clone());
            }
            "--employee-id" => {
                i += 1;
                employee_id = Some(args.get(i).context("Missing --employee-id value")?.clone());
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        config_path,
        role,
        server_url,
        fallback_url,
        room,
        name,
        employee_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("dispatch-client")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults() {
        let args = parse_from(&argv(&[])).unwrap();
        assert_eq!(args.role, Role::Caller);
        assert_eq!(args.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(args.server_url.is_none());
    }

    #[test]
    fn overrides_apply_to_config() {
        let args = parse_from(&argv(&[
            "--role",
            "Agent",
            "--server-url",
            "wss://dispatch.example.com/ws",
            "--fallback-url",
            "ws://10.0.0.2:5000/ws",
            "--room",
            "incident-7",
            "--name",
            "Desk 3",
        ]))
        .unwrap();
        assert_eq!(args.role, Role::Agent);

        let mut config = DispatchConfig::default();
        args.apply(&mut config);
        assert_eq!(config.signaling.primary_url, "wss://dispatch.example.com/ws");
        assert_eq!(
            config.signaling.fallback_url.as_deref(),
            Some("ws://10.0.0.2:5000/ws")
        );
        assert_eq!(config.session.default_room, "incident-7");
        assert_eq!(config.session.display_name, "Desk 3");
    }

    #[test]
    fn bad_arguments() {
        assert!(parse_from(&argv(&["--role", "dispatcher"])).is_err());
        assert!(parse_from(&argv(&["--room"])).is_err());
        let err = parse_from(&argv(&["--port", "80"])).unwrap_err();
        assert!(err.to_string().contains("Unknown argument"));
    }
}
