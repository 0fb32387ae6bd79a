use clap::{App, Arg};
use conduit::link::Role;
use conduit::relay::Relay;
use lodestone::config::RelayConfig;
use lodestone::logging;

pub fn main() {
    let matches = App::new("Conduit Local Proxy")
        .version("0.1")
        .about("Accepts SOCKS5 clients and relays them to a conduit server over an encrypted channel.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config = RelayConfig::load(matches.value_of("CONFIG_FILE").unwrap());
    let log = logging::init();

    logging::info!(log, "starting local proxy"; "listen" => %config.listen);

    let mut relay = Relay::new(Role::Local, &config, &log).expect("Error creating relay");
    relay.run().expect("Relay terminated");
}
