use clap::{App, Arg};
use std::path::Path;
use std::process;
use vault::accessor::{self, Accessor, GetOptions};

fn main() {
    let matches = App::new("Secret Storage Control")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Command line interface to the secret storage daemon.")
        .arg(
            Arg::with_name("socket")
                .long("socket")
                .value_name("PATH")
                .help("Path of the socket file to connect with the server")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ping")
                .long("ping")
                .help("Check if a server is up and running"),
        )
        .arg(
            Arg::with_name("terminate")
                .long("terminate")
                .help("Terminate the server"),
        )
        .arg(
            Arg::with_name("hex")
                .long("hex")
                .help("Indicate the KEY specified is base16 encoded"),
        )
        .arg(
            Arg::with_name("get")
                .long("get")
                .value_name("KEY")
                .help("Get the secret value associated with the KEY")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("check")
                .long("check")
                .value_name("KEY")
                .help("Check if a value associated with the KEY exists on the server")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("set")
                .long("set")
                .value_name("KEY")
                .help("Store a secret under the KEY; the value is asked on the terminal")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("delete")
                .long("delete")
                .value_name("KEY")
                .help("Delete the secret value associated with the KEY")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("key")
                .long("key")
                .value_name("LENGTH")
                .help("Generate a random key of LENGTH bytes and print it hex encoded")
                .takes_value(true),
        )
        .get_matches();

    if let Some(path) = matches.value_of("socket") {
        if !accessor::set_socket_path(Some(Path::new(path))) {
            println!("cannot use this socket path due to security consideration");
            process::exit(1);
        }
    }

    if matches.is_present("ping") {
        if accessor::ping() {
            println!("pong");
        } else {
            println!("biu~");
        }
        return;
    }

    if matches.is_present("terminate") {
        accessor::terminate_server();
        return;
    }

    if let Some(length) = matches.value_of("key") {
        let length: usize = length.parse().unwrap_or_else(|_| {
            eprintln!("cannot convert {}.", length);
            process::exit(1);
        });

        let key = accessor::make_secured_key(length);
        let encoded = accessor::encode_string(key.as_bytes());
        println!("key: {}", String::from_utf8_lossy(encoded.as_bytes()));
        accessor::release_secured_string(encoded);
        accessor::release_secured_string(key);
        return;
    }

    let hex = matches.is_present("hex");
    let plain_key = |raw: &str| -> Vec<u8> {
        if hex {
            let decoded = Accessor::decode_string(raw.as_bytes());
            if decoded.is_empty() {
                eprintln!("invalid base16 key {}", raw);
                process::exit(1);
            }
            decoded
        } else {
            raw.as_bytes().to_vec()
        }
    };

    if let Some(raw) = matches.value_of("get") {
        let key = plain_key(raw);
        let result = accessor::get_secret(&key, GetOptions::new());
        if result.is_empty() {
            println!("--x \x1b[1;31mNot Exist\x1b[0m");
        } else {
            println!("--> {}", String::from_utf8_lossy(result.as_bytes()));
            accessor::release_secured_string(result);
        }
    } else if let Some(raw) = matches.value_of("check") {
        let key = plain_key(raw);
        if accessor::exists(&key) {
            println!("--> exists");
        } else {
            println!("--> nope");
        }
    } else if let Some(raw) = matches.value_of("set") {
        let key = plain_key(raw);
        let value = accessor::ask_secret("Enter secret value", None);
        let succeed = accessor::submit_secret(&key, value.as_bytes(), false);
        accessor::release_secured_string(value);
        if succeed {
            println!("--> ok");
        } else {
            println!("--> failed");
        }
    } else if let Some(raw) = matches.value_of("delete") {
        let key = plain_key(raw);
        if accessor::remove_secret(&key, false) {
            println!("--> ok");
        } else {
            println!("--> failed");
        }
    }
}
