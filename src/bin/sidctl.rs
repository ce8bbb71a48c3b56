//! `sidctl` — minimal admin client for the SID daemon: hand-rolled argv
//! parsing, no `clap`, since the surface is a handful of fixed subcommands.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use sid::proto::{Request, Response, Status};

fn usage() -> ! {
    eprintln!("usage: sidctl [--socket PATH] <COMMAND> [ARGS...]");
    eprintln!("commands: VERSION, DBSTATS, DBDUMP, RESOURCES, ACTIVE, CHECKPOINT, DBRESTORE");
    eprintln!("          SCAN <device.json>  (device.json: a serialized DeviceHandle)");
    std::process::exit(2);
}

fn main() {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut socket_path = "/run/sid.sock".to_string();

    if args.first().map(String::as_str) == Some("--socket") {
        if args.len() < 2 {
            usage();
        }
        socket_path = args.remove(1);
        args.remove(0);
    }

    if args.is_empty() {
        usage();
    }
    let command = args.remove(0);

    // SCAN's device descriptor rides as the request payload rather than a
    // plain arg, since it is structured (major/minor, hierarchy, udev
    // properties) rather than a scalar.
    let payload = if command == "SCAN" && !args.is_empty() {
        let path = args.remove(0);
        match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("sidctl: failed to read {path}: {e}");
                std::process::exit(1);
            }
        }
    } else {
        Vec::new()
    };

    let request = Request { command, args, payload };
    match send_request(&socket_path, &request) {
        Ok(response) => print_response(&response),
        Err(e) => {
            eprintln!("sidctl: {e}");
            std::process::exit(1);
        }
    }
}

fn send_request(socket_path: &str, request: &Request) -> std::io::Result<Response> {
    let mut stream = UnixStream::connect(socket_path)?;
    let encoded = serde_json::to_vec(request)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = (encoded.len() as u32).to_le_bytes();
    stream.write_all(&len)?;
    stream.write_all(&encoded)?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn print_response(response: &Response) {
    match response.status {
        Status::Ok => {
            std::io::stdout().write_all(&response.body).ok();
            println!();
        }
        Status::Error => {
            eprintln!("error: {}", response.error.as_deref().unwrap_or("unknown error"));
            std::process::exit(1);
        }
        Status::ExpectingData | Status::ExpectingExpbufAck => {
            println!("command is awaiting further input ({:?})", response.status);
        }
    }
}
