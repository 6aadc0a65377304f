// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The far-memory server daemon. Listens for one control connection plus
//! request connections, serves the opcode loop until a client drives the
//! Shutdown opcode, then exits 0.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use bpaf::Parser;
use farmem::args;
use farmem::control_server;
use farmem::prelude::*;
use farmem::server;
use farmem::server::ServerStore;
use farmem::utils;
use serde_derive::Deserialize;
use serde_derive::Serialize;

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FarmemdConfig {
    listen_addr: String,
    port: u16,
    control_socket: PathBuf,
    log_file: Option<PathBuf>,
    stderr_log_level: String,
    file_log_level: String,
}

impl Default for FarmemdConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 8000,
            control_socket: args::default_control_socket_path("farmemd"),
            log_file: None,
            stderr_log_level: "info".to_string(),
            file_log_level: "trace".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Cli {
    config_file: Option<PathBuf>,
    print_default_config: bool,
    listen_addr: Option<String>,
    port: Option<u16>,
    control_socket: Option<PathBuf>,
    log_file: Option<PathBuf>,
    stderr_log_level: Option<String>,
    file_log_level: Option<String>,
}

fn cli() -> impl Parser<Cli> {
    let config_file = args::config_file();
    let print_default_config = args::print_default_config();
    let listen_addr = bpaf::long("listen-addr")
        .argument::<String>("ADDR")
        .help("Address to bind, without the port.")
        .optional();
    let port = bpaf::long("port")
        .argument::<u16>("PORT")
        .help("TCP port to listen on.")
        .optional();
    let control_socket = bpaf::long("control-socket")
        .argument::<PathBuf>("PATH")
        .help("Unix socket for out-of-band control commands.")
        .optional();
    let log_file = bpaf::long("log-file")
        .argument::<PathBuf>("PATH")
        .optional();
    let stderr_log_level = bpaf::long("stderr-log-level")
        .argument::<String>("LEVEL")
        .optional();
    let file_log_level = bpaf::long("file-log-level")
        .argument::<String>("LEVEL")
        .optional();
    bpaf::construct!(Cli {
        config_file,
        print_default_config,
        listen_addr,
        port,
        control_socket,
        log_file,
        stderr_log_level,
        file_log_level,
    })
}

impl Cli {
    fn apply(self, config: &mut FarmemdConfig) {
        if let Some(listen_addr) = self.listen_addr {
            config.listen_addr = listen_addr;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(control_socket) = self.control_socket {
            config.control_socket = control_socket;
        }
        if let Some(log_file) = self.log_file {
            config.log_file = Some(log_file);
        }
        if let Some(level) = self.stderr_log_level {
            config.stderr_log_level = level;
        }
        if let Some(level) = self.file_log_level {
            config.file_log_level = level;
        }
    }
}

fn start_control_server(sock_path: PathBuf, store: Arc<ServerStore>) -> Result<()> {
    control_server::start(sock_path, move |cmd: &str| match cmd {
        "ds-count" => Ok(store.ds_count().to_string()),
        "status" => Ok("serving".to_string()),
        other => bail!("unknown control command {other:?}"),
    })
}

pub fn main() -> Result<()> {
    let cli = cli().to_options().run();
    if cli.print_default_config {
        args::print_default_config_and_exit::<FarmemdConfig>();
    }

    let mut config: FarmemdConfig =
        args::load_or_default(cli.config_file.as_deref(), "farmemd").location(loc!())?;
    cli.apply(&mut config);

    utils::init_tracing(
        args::parse_level(&config.stderr_log_level).location(loc!())?,
        config.log_file.as_deref(),
        args::parse_level(&config.file_log_level).location(loc!())?,
    )
    .location(loc!())?;
    utils::abort_process_on_panic();
    info!("farmemd running config: {config:?}");

    let store = Arc::new(ServerStore::new());
    if let Err(e) = start_control_server(config.control_socket.clone(), store.clone()) {
        warn!("control server unavailable: {e:?}");
    }

    let addr = format!("{}:{}", config.listen_addr, config.port);
    let listener = TcpListener::bind(&addr).with_context(loc!(), || format!("binding {addr}"))?;
    server::serve_with_store(listener, store).location(loc!())?;
    Ok(())
}
