//! Framing over a real TCP connection

use setu_proto::{Framer, Framing, decode};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

#[test]
fn test_line_frames_survive_byte_by_byte_writes() {
    let (mut client, mut server) = pair();
    server
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    let writer = thread::spawn(move || {
        client.set_nodelay(true).unwrap();
        for byte in b"GEODATA|12.5|3.0|48.1|11.5\nCONDATA|42\n" {
            client.write_all(&[*byte]).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        client
    });

    let mut framer = Framer::new(Framing::Line);
    let first = framer.read_frame(&mut server).unwrap().unwrap();
    let second = framer.read_frame(&mut server).unwrap().unwrap();
    let _client = writer.join().unwrap();

    assert_eq!(decode(&first).unwrap().fields.len(), 4);
    assert_eq!(decode(&second).unwrap().parse_field::<u32>(0), Some(42));
}

#[test]
fn test_read_timeout_yields_none() {
    let (_client, mut server) = pair();
    server
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();

    let mut framer = Framer::new(Framing::Line);
    assert!(framer.read_frame(&mut server).unwrap().is_none());
}

#[test]
fn test_writer_and_reader_agree() {
    let (mut client, mut server) = pair();
    server
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    let framer = Framer::new(Framing::Line);
    framer.write_frame(&mut client, "WLAN|home|secret").unwrap();
    framer.write_frame(&mut client, "WLANDATA|10.0.0.2").unwrap();

    let mut reader = Framer::new(Framing::Line);
    assert_eq!(
        reader.read_frame(&mut server).unwrap().as_deref(),
        Some("WLAN|home|secret")
    );
    assert_eq!(
        reader.read_frame(&mut server).unwrap().as_deref(),
        Some("WLANDATA|10.0.0.2")
    );
}
