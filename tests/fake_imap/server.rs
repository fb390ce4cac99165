//! Plaintext in-process IMAP server bound to an ephemeral port.
//!
//! The engine under test connects over real TCP; tests share the `Store`
//! behind the server and mutate or inspect it directly between cycles.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};

use super::store::{execute, Command, Session, Store};

pub struct FakeImapServer {
    pub port: u16,
    pub store: Arc<Mutex<Store>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    pub async fn start(store: Store) -> FakeImapServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let port = listener.local_addr().unwrap().port();
        let store = Arc::new(Mutex::new(store));

        let shared = store.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let store = shared.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, store).await;
                });
            }
        });

        FakeImapServer {
            port,
            store,
            _handle: handle,
        }
    }

    /// Run a closure against the shared store.
    pub fn with_store<T>(&self, f: impl FnOnce(&mut Store) -> T) -> T {
        let mut store = self.store.lock().unwrap();
        f(&mut store)
    }
}

async fn serve(socket: TcpStream, store: Arc<Mutex<Store>>) -> std::io::Result<()> {
    let mut stream = BufStream::new(socket);
    {
        let greeting = {
            let store = store.lock().unwrap();
            format!(
                "* OK [CAPABILITY {}] fake server ready\r\n",
                caps_of(&store)
            )
        };
        stream.write_all(greeting.as_bytes()).await?;
        stream.flush().await?;
    }

    let mut session = Session::default();
    loop {
        let Some(cmd) = read_command(&mut stream).await? else {
            return Ok(());
        };
        let response = {
            let mut store = store.lock().unwrap();
            execute(&mut store, &mut session, &cmd)
        };
        stream.write_all(&response).await?;
        stream.flush().await?;
        if session.done {
            return Ok(());
        }
    }
}

fn caps_of(store: &Store) -> String {
    let mut caps = vec!["IMAP4rev1", "UIDPLUS", "LITERAL+", "SPECIAL-USE", "XLIST"];
    if store.condstore {
        caps.push("CONDSTORE");
    }
    if store.gmail {
        caps.push("X-GM-EXT-1");
    }
    caps.join(" ")
}

/// Read one command with literal framing: a line ending in `{n}` gets a
/// continuation prompt, `{n+}` does not; either way the next `n` bytes are
/// the literal and the command continues on the following line.
async fn read_command(
    stream: &mut BufStream<TcpStream>,
) -> std::io::Result<Option<Command>> {
    let mut parts: Vec<(String, Option<Vec<u8>>)> = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = stream.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        let text = String::from_utf8_lossy(&line).into_owned();

        match literal_marker(&text) {
            Some((len, plus)) => {
                if !plus {
                    stream.write_all(b"+ OK send literal\r\n").await?;
                    stream.flush().await?;
                }
                let mut data = vec![0u8; len];
                stream.read_exact(&mut data).await?;
                let text = text[..text.rfind('{').unwrap()].to_string();
                parts.push((text, Some(data)));
            }
            None => {
                parts.push((text, None));
                return Ok(Some(Command { parts }));
            }
        }
    }
}

fn literal_marker(text: &str) -> Option<(usize, bool)> {
    let stripped = text.strip_suffix('}')?;
    let open = stripped.rfind('{')?;
    let digits = &stripped[open + 1..];
    let plus = digits.ends_with('+');
    let len: usize = digits.trim_end_matches('+').parse().ok()?;
    Some((len, plus))
}
