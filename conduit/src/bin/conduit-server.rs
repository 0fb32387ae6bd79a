use clap::{App, Arg};
use conduit::link::Role;
use conduit::relay::Relay;
use lodestone::config::RelayConfig;
use lodestone::logging;

pub fn main() {
    let matches = App::new("Conduit Server Proxy")
        .version("0.1")
        .about("Accepts encrypted conduit connections and forwards them to the requested origins.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config = RelayConfig::load(matches.value_of("CONFIG_FILE").unwrap());
    let log = logging::init();

    logging::info!(log, "starting server proxy"; "listen" => %config.listen);

    let mut relay = Relay::new(Role::Server, &config, &log).expect("Error creating relay");
    relay.run().expect("Relay terminated");
}
