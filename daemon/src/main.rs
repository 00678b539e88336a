use clap::{App, Arg};
use keep::logging;
use serde_derive::Deserialize;
use sloggers::LoggerConfig;
use std::path::{Path, PathBuf};
use std::process;
use vault::server::Server;

/// Daemon settings, loadable from a TOML file. Command line arguments win
/// over the file.
#[derive(Deserialize)]
struct DaemonConfig {
    socket: Option<PathBuf>,
    #[serde(default)]
    replace: bool,
    logger: Option<LoggerConfig>,
}

impl Default for DaemonConfig {
    fn default() -> DaemonConfig {
        DaemonConfig {
            socket: None,
            replace: false,
            logger: None,
        }
    }
}

impl DaemonConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> DaemonConfig {
        serdeconv::from_toml_file(path).expect("Error loading daemon configuration file")
    }
}

pub fn main() {
    let matches = App::new("Secret Storage")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the in-memory secret storage daemon.")
        .arg(
            Arg::with_name("socket")
                .long("socket")
                .value_name("PATH")
                .help("Path of the socket file to serve on")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("replace")
                .long("replace")
                .help("Take over a stale socket file left behind by a crashed server"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("Path to the config file")
                .takes_value(true),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => DaemonConfig::load(path),
        None => DaemonConfig::default(),
    };

    // Initialize logging
    let logger = match &config.logger {
        Some(logger_config) => logging::from_config(logger_config),
        None => logging::init(),
    };

    let socket = matches.value_of("socket").map(PathBuf::from).or(config.socket);
    let replace = matches.is_present("replace") || config.replace;

    let mut server = match Server::bind(socket.as_deref(), replace, &logger) {
        Ok(server) => server,
        Err(error) => {
            logging::error!(logger, "cannot start server"; "error" => ?error);
            process::exit(1);
        }
    };

    server.run();
}
