//! Standalone VSOA gateway: binds a server on the configured address, registers a small set of
//! built-in RPC routes, and republishes client connect/disconnect events as log lines. Grounded
//! on `services/authenticator`'s config-path-argument shape and `vsoa-server`'s own tick loop.

use std::time::Instant;

use clap::{App, Arg};
use vsoa_codec::status;
use vsoa_server::{Server, ServerConfig, ServerEvent};

fn main() {
    let matches = App::new("VSOA Gateway")
        .version("1.0")
        .author("ACOAUTO Team")
        .about("Runs a standalone VSOA server with built-in diagnostic routes.")
        .arg(Arg::with_name("CONFIG_FILE").help("Path to the config file").required(true))
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").expect("CONFIG_FILE is required");
    let config = ServerConfig::load(config_path);

    let log = config.logging.build_logger().new(slog::o!("component" => "vsoa-gateway"));
    let mut server = Server::with_logger(config, log.clone()).expect("failed to bind server");

    register_ping_route(&mut server);
    register_echo_route(&mut server);

    slog::info!(log, "vsoa-gateway listening"; "addr" => %server.local_addr().expect("server has no local address"));

    loop {
        let now = Instant::now();
        server.tick(now);
        for event in server.events() {
            match event {
                ServerEvent::Connected(id, addr) => {
                    slog::info!(log, "client connected"; "client" => id, "addr" => %addr);
                }
                ServerEvent::Disconnected(id) => {
                    slog::info!(log, "client disconnected"; "client" => id);
                }
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}

/// `/sys/ping` always replies SUCCESS with no payload, for clients probing reachability over RPC
/// rather than the dedicated ping-echo frame.
fn register_ping_route(server: &mut Server) {
    let listener = server.add_rpc_listener(b"/sys/ping").expect("failed to register /sys/ping");
    listener.chain.add_listener(Box::new(|_req, resolve| {
        resolve.reply(status::SUCCESS, 0, b"", b"");
        true
    }));
}

/// `/sys/echo` replies with whatever param/data the caller sent, useful for exercising a fresh
/// client implementation against a known-good server.
fn register_echo_route(server: &mut Server) {
    let listener = server.add_rpc_listener(b"/sys/echo").expect("failed to register /sys/echo");
    listener.chain.add_listener(Box::new(|req, resolve| {
        resolve.reply(status::SUCCESS, req.tunid, &req.param, &req.data);
        true
    }));
}
