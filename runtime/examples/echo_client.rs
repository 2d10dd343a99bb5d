//! Sends a handful of pipelined frames to `echo_server` and prints the replies.

use std::io::{Read, Write};
use std::net::TcpStream;

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = i32::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

fn main() -> std::io::Result<()> {
    let mut stream = TcpStream::connect("127.0.0.1:9090")?;

    let messages: &[&[u8]] = &[b"hello", b"pipelined", b"world"];
    let mut wire = Vec::new();
    for message in messages {
        wire.extend(framing::encode(message));
    }
    stream.write_all(&wire)?;

    for _ in messages {
        let reply = read_frame(&mut stream)?;
        println!("{}", String::from_utf8_lossy(&reply));
    }

    Ok(())
}
