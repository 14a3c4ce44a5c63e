//! Blocking test servers on std sockets. Each runs on its own thread so
//! the event loop under test stays on the test thread.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

/// Request line plus headers, as received.
pub struct Request {
    pub head: String,
    pub body: Vec<u8>,
}

impl Request {
    pub fn path(&self) -> &str {
        self.head.split(' ').nth(1).unwrap_or("")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }
}

/// Read one request head from `reader`. The body is left unread.
pub fn read_head(reader: &mut BufReader<TcpStream>) -> Request {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
            break;
        }
        head.push_str(&line);
    }
    Request {
        head,
        body: Vec::new(),
    }
}

/// Read a request head and a `Content-Length` body.
pub fn read_request(reader: &mut BufReader<TcpStream>) -> Request {
    let mut request = read_head(reader);
    let len: usize = request
        .header("Content-Length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    request.body = vec![0; len];
    reader.read_exact(&mut request.body).unwrap();
    request
}

/// Accept one connection and hand it to `handler`.
pub fn serve<F>(handler: F) -> SocketAddr
where
    F: FnOnce(BufReader<TcpStream>, TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        handler(reader, stream);
    });
    addr
}

/// Accept one connection, read the request, write `chunks` with a short
/// pause between them, then close.
pub fn serve_chunks(chunks: Vec<Vec<u8>>) -> SocketAddr {
    serve(move |mut reader, mut stream| {
        read_request(&mut reader);
        for chunk in chunks {
            stream.write_all(&chunk).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
        }
    })
}

/// Accept one connection and answer with `response` in a single write.
pub fn serve_once(response: &'static str) -> SocketAddr {
    serve_chunks(vec![response.as_bytes().to_vec()])
}

/// Accept connections until the test exits, answering each request with
/// what `route` returns for it.
pub fn serve_routes<F>(route: F) -> SocketAddr
where
    F: Fn(SocketAddr, &Request) -> String + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let request = read_request(&mut reader);
            let response = route(addr, &request);
            let _ = stream.write_all(response.as_bytes());
        }
    });
    addr
}
