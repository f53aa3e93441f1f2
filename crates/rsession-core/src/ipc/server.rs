//! Worker side of the protocol.
//!
//! [`serve`] owns the accept loop. What actually evaluates code is supplied
//! through [`WorkerHost`], so the `rsession-worker` binary plugs in an R
//! bridge while tests plug in a toy interpreter.

use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::SpawnedWorker;
use crate::error::{Error, Result};

use super::protocol::{EngineRequest, EngineResponse, Value, read_message, write_message};

/// Failure inside an [`Interpreter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterError {
    /// The code raised an error; the interpreter is still usable.
    Raised(String),
    /// The interpreter is gone; the connection is dropped.
    Lost(String),
}

/// Evaluates requests for one session.
pub trait Interpreter: Send {
    fn eval(&mut self, code: &str) -> std::result::Result<Value, InterpreterError>;
    fn assign(&mut self, name: &str, value: Value) -> std::result::Result<(), InterpreterError>;
    fn collect(&mut self, name: &str) -> std::result::Result<Value, InterpreterError>;
}

/// Supplies interpreters and, for masters, workers.
pub trait WorkerHost: Send + Sync {
    /// Start an interpreter for a newly authenticated session.
    fn start_interpreter(&self) -> Result<Box<dyn Interpreter>>;

    /// Start a worker process and report where it listens.
    fn spawn_worker(&self) -> Result<SpawnedWorker> {
        Err(Error::Ipc("this instance does not spawn workers".to_string()))
    }

    /// Called once when a master is told to shut down.
    fn shutdown(&self) {}
}

/// How many sessions a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// Serve the first authenticated connection, then return.
    SingleSession,
    /// Serve connections concurrently until a `Shutdown` request.
    Master,
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub token: String,
    pub mode: ServeMode,
}

enum ConnectionEnd {
    Rejected,
    Closed,
    ShutdownRequested,
}

/// Run the accept loop on `listener`.
pub fn serve(listener: TcpListener, host: Arc<dyn WorkerHost>, options: ServeOptions) -> Result<()> {
    let local = listener.local_addr()?;
    tracing::debug!("serving {:?} on {}", options.mode, local);

    match options.mode {
        ServeMode::SingleSession => {
            for stream in listener.incoming() {
                let stream = stream?;
                match serve_connection(stream, host.as_ref(), &options.token)? {
                    ConnectionEnd::Rejected => continue,
                    ConnectionEnd::Closed | ConnectionEnd::ShutdownRequested => return Ok(()),
                }
            }
            Ok(())
        }
        ServeMode::Master => {
            let stopping = Arc::new(AtomicBool::new(false));
            for stream in listener.incoming() {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                        continue;
                    }
                };

                let host = Arc::clone(&host);
                let token = options.token.clone();
                let stopping = Arc::clone(&stopping);
                std::thread::spawn(move || {
                    match serve_connection(stream, host.as_ref(), &token) {
                        Ok(ConnectionEnd::ShutdownRequested) => {
                            stopping.store(true, Ordering::SeqCst);
                            host.shutdown();
                            // Wake the accept loop so it sees the flag.
                            let _ = TcpStream::connect(local);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("session ended with error: {}", e),
                    }
                });
            }
            Ok(())
        }
    }
}

fn serve_connection(stream: TcpStream, host: &dyn WorkerHost, token: &str) -> Result<ConnectionEnd> {
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    match read_message::<_, EngineRequest>(&mut reader) {
        Ok(EngineRequest::Hello { token: offered }) if offered == token => {
            write_message(&mut writer, &EngineResponse::Ready)?;
        }
        Ok(EngineRequest::Hello { .. }) => {
            let _ = write_message(
                &mut writer,
                &EngineResponse::Denied {
                    reason: "invalid credentials".to_string(),
                },
            );
            return Ok(ConnectionEnd::Rejected);
        }
        Ok(_) => {
            let _ = write_message(
                &mut writer,
                &EngineResponse::Denied {
                    reason: "expected hello".to_string(),
                },
            );
            return Ok(ConnectionEnd::Rejected);
        }
        // Port checks, wake-up connections and undecodable frames close without a word.
        Err(_) => return Ok(ConnectionEnd::Rejected),
    }

    let mut interpreter: Option<Box<dyn Interpreter>> = None;

    loop {
        let request: EngineRequest = match read_message(&mut reader) {
            Ok(request) => request,
            Err(_) => return Ok(ConnectionEnd::Closed),
        };

        let response = match request {
            EngineRequest::Ping => EngineResponse::Pong,
            EngineRequest::Hello { .. } => EngineResponse::Fault {
                message: "already authenticated".to_string(),
            },
            EngineRequest::Eval { code } => {
                let interp = interpreter_for(&mut interpreter, host)?;
                respond_value(interp.eval(&code))?
            }
            EngineRequest::Assign { name, value } => {
                let interp = interpreter_for(&mut interpreter, host)?;
                match interp.assign(&name, value) {
                    Ok(()) => EngineResponse::Done,
                    Err(InterpreterError::Raised(message)) => EngineResponse::Fault { message },
                    Err(InterpreterError::Lost(reason)) => return Err(lost(reason)),
                }
            }
            EngineRequest::Collect { name } => {
                let interp = interpreter_for(&mut interpreter, host)?;
                respond_value(interp.collect(&name))?
            }
            EngineRequest::SpawnWorker => match host.spawn_worker() {
                Ok(SpawnedWorker { port, pid }) => EngineResponse::Spawned { port, pid },
                Err(e) => EngineResponse::Fault {
                    message: e.to_string(),
                },
            },
            EngineRequest::Shutdown => {
                let _ = write_message(&mut writer, &EngineResponse::ShuttingDown);
                return Ok(ConnectionEnd::ShutdownRequested);
            }
        };

        if write_message(&mut writer, &response).is_err() {
            return Ok(ConnectionEnd::Closed);
        }
    }
}

fn interpreter_for<'a>(
    slot: &'a mut Option<Box<dyn Interpreter>>,
    host: &dyn WorkerHost,
) -> Result<&'a mut Box<dyn Interpreter>> {
    if slot.is_none() {
        *slot = Some(host.start_interpreter()?);
    }
    slot.as_mut()
        .ok_or_else(|| Error::Ipc("interpreter unavailable".to_string()))
}

fn respond_value(result: std::result::Result<Value, InterpreterError>) -> Result<EngineResponse> {
    match result {
        Ok(value) => Ok(EngineResponse::Value { value }),
        Err(InterpreterError::Raised(message)) => Ok(EngineResponse::Fault { message }),
        Err(InterpreterError::Lost(reason)) => Err(lost(reason)),
    }
}

fn lost(reason: String) -> Error {
    Error::Ipc(format!("interpreter lost: {}", reason))
}
