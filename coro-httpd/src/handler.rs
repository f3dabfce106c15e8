//! The line-oriented demo protocol served by `coro-httpd`.
//!
//! A connection stays open and is read line by line (mirroring the
//! original demo's `handle_client` loop): `exit` closes the connection with
//! no reply; `shutdown` additionally requests process-wide shutdown and
//! then closes; anything else gets back a tiny HTTP/1.1 response whose body
//! is the configured document followed by the raw bytes that were sent, so
//! a client can see its own request echoed after the static page, and the
//! connection stays open for the next line.

use std::sync::OnceLock;

use corort_net::{request_shutdown, Client};

static DOCUMENT: OnceLock<Vec<u8>> = OnceLock::new();

/// Load the document served to every non-control request. Call once, before
/// the server starts accepting, from the thread that will go on to serve
/// connections — `OnceLock` makes a second call a silent no-op rather than
/// a panic, which keeps tests free to call this more than once.
pub fn set_document(bytes: Vec<u8>) {
    let _ = DOCUMENT.set(bytes);
}

/// The `corort_net::ServeFn` wired up in `main`. Runs one connection to
/// completion: reads lines until `exit`, `shutdown`, disconnect, or a read
/// error, responding to every other line with the document + echo.
pub fn serve(client: Client) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match client.read(&mut buf) {
            Ok(0) => {
                log::debug!("{}: disconnected", client.remote_addr());
                return;
            }
            Ok(n) => n,
            Err(e) => {
                log::warn!("{}: read failed: {e}", client.remote_addr());
                return;
            }
        };

        let line = String::from_utf8_lossy(&buf[..n]);
        let trimmed = line.trim_end_matches(['\r', '\n']);

        match trimmed {
            "exit" => {
                log::info!("{}: exit", client.remote_addr());
                return;
            }
            "shutdown" => {
                log::info!("{}: shutdown requested", client.remote_addr());
                request_shutdown(&client);
                return;
            }
            _ => {
                if let Err(e) = respond(&client, &buf[..n]) {
                    log::warn!("{}: write failed: {e}", client.remote_addr());
                    return;
                }
            }
        }
    }
}

fn respond(client: &Client, payload: &[u8]) -> std::io::Result<()> {
    let document = DOCUMENT.get().map(Vec::as_slice).unwrap_or(b"");
    let mut body = Vec::with_capacity(document.len() + payload.len());
    body.extend_from_slice(document);
    body.extend_from_slice(payload);

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    client.write(header.as_bytes())?;
    client.write(&body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::sync::Mutex;

    use corort_net::{AcceptStatus, DispatcherConfig, Server};

    // Server::bind installs a process-wide SIGUSR1 handler and touches
    // corort_net's shutdown statics, so only one test in this binary may
    // drive a live Server at a time.
    static SERVER_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn bind_loopback() -> Server {
        Server::bind_with(
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            0,
            DispatcherConfig { thread_count: 1, backlog: 16 },
        )
        .expect("bind")
    }

    #[test]
    fn serve_responds_with_document_then_echo() {
        let _guard = SERVER_TEST_LOCK.lock().unwrap();
        set_document(b"<html><body>hi</body></html>".to_vec());

        let server = bind_loopback();
        let port = server.local_addr().expect("local_addr").port();

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("connect");
            stream.write_all(b"hello\n").unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).unwrap();
            response
        });

        match server.accept(serve) {
            AcceptStatus::Connected(_) => {}
            AcceptStatus::ShutdownRequested => panic!("unexpected shutdown"),
            AcceptStatus::Error(e) => panic!("accept failed: {e}"),
        }

        let response = client.join().expect("client thread");
        let text = String::from_utf8_lossy(&response);

        let expected_body = b"<html><body>hi</body></html>hello\n".to_vec();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains(&format!("Content-Length: {}\r\n", expected_body.len())));
        assert!(response.ends_with(&expected_body));

        server.close().expect("close");
    }

    #[test]
    fn serve_closes_connection_on_exit_without_replying() {
        let _guard = SERVER_TEST_LOCK.lock().unwrap();

        let server = bind_loopback();
        let port = server.local_addr().expect("local_addr").port();

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("connect");
            stream.write_all(b"exit\n").unwrap();
            let mut response = Vec::new();
            // `exit` sends no reply and closes; read_to_end returns once the
            // peer's fd is closed by the dispatcher's serve trampoline.
            stream.read_to_end(&mut response).unwrap();
            response
        });

        match server.accept(serve) {
            AcceptStatus::Connected(_) => {}
            AcceptStatus::ShutdownRequested => panic!("unexpected shutdown"),
            AcceptStatus::Error(e) => panic!("accept failed: {e}"),
        }

        let response = client.join().expect("client thread");
        assert!(response.is_empty());

        server.close().expect("close");
    }
}
