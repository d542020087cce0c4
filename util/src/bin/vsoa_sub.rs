//! Connects to a VSOA server and prints every publish received on a URL, for exercising
//! publishers during manual testing. Grounded on `vsoa-client::Client`'s subscribe/callback API.

use std::time::Duration;

use clap::{App, Arg};

use vsoa_client::{Client, ClientConfig};

fn main() {
    let matches = App::new("vsoa-sub")
        .version("1.0")
        .about("Subscribes to a URL and prints every publish received")
        .arg(Arg::with_name("SERVER").long("server").takes_value(true).default_value("127.0.0.1:8080"))
        .arg(Arg::with_name("URL").long("url").takes_value(true).default_value("/test/counter"))
        .arg(Arg::with_name("PASSWORD").long("password").takes_value(true))
        .get_matches();

    let server_addr = matches.value_of("SERVER").unwrap().to_owned();
    let url = matches.value_of("URL").unwrap().as_bytes().to_vec();

    let log = vsoa_support::logging::default_logger();
    let config = ClientConfig { server_addr, passwd: matches.value_of("PASSWORD").map(str::to_owned), ..ClientConfig::default() };

    let (client, info) = Client::connect(&config, log.new(slog::o!("component" => "vsoa-sub"))).expect("failed to connect");
    slog::info!(log, "connected"; "info" => String::from_utf8_lossy(&info).into_owned());

    client
        .subscribe(
            &url,
            Box::new(|param: &[u8], data: &[u8]| {
                println!(
                    "publish: param={} data={}",
                    String::from_utf8_lossy(param),
                    String::from_utf8_lossy(data)
                );
            }),
        )
        .expect("subscribe failed");

    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}
