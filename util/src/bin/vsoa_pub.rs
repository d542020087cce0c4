//! Starts a bare VSOA server and periodically publishes on a URL, for exercising subscribers
//! during manual testing. Grounded on `vsoa-server`'s own `Server::tick` loop.

use std::time::{Duration, Instant};

use clap::{App, Arg};

use vsoa_server::{Server, ServerConfig, ServerEvent};

fn main() {
    let matches = App::new("vsoa-pub")
        .version("1.0")
        .about("Publishes test traffic on a URL at a fixed interval")
        .arg(Arg::with_name("LISTEN").long("listen").takes_value(true).default_value("127.0.0.1:8080"))
        .arg(Arg::with_name("URL").long("url").takes_value(true).default_value("/test/counter"))
        .arg(Arg::with_name("INTERVAL_MS").long("interval-ms").takes_value(true).default_value("500"))
        .get_matches();

    let listen_addr = matches.value_of("LISTEN").unwrap().to_owned();
    let url = matches.value_of("URL").unwrap().as_bytes().to_vec();
    let interval: u64 = matches.value_of("INTERVAL_MS").unwrap().parse().expect("--interval-ms must be an integer");

    let log = vsoa_support::logging::default_logger();
    let config = ServerConfig { listen_addr, ..ServerConfig::default() };
    let mut server = Server::with_logger(config, log.new(slog::o!("component" => "vsoa-pub"))).expect("failed to bind server");

    slog::info!(log, "vsoa-pub listening"; "addr" => %server.local_addr().unwrap());

    let mut tick = 0u64;
    let mut last_publish = Instant::now() - Duration::from_millis(interval);
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

        if now.duration_since(last_publish) >= Duration::from_millis(interval) {
            let payload = format!("{{\"tick\":{}}}", tick);
            server.publish(&url, b"", payload.as_bytes());
            tick += 1;
            last_publish = now;
        }

        std::thread::sleep(Duration::from_millis(5));
    }
}
