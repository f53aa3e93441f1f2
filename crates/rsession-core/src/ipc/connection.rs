//! Host side of the worker protocol.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};

use crate::engine::{EngineConnection, EngineConnectionConfig, SpawnedWorker};
use crate::error::{EngineFault, Error, Result};

use super::protocol::{EngineRequest, EngineResponse, Value, read_message, write_message};

/// An authenticated loopback TCP connection to a worker or master.
pub struct TcpConnection {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    address: String,
}

impl TcpConnection {
    /// Connect and perform the credentials handshake.
    pub fn connect(config: &EngineConnectionConfig) -> Result<Self> {
        let address = config.address();
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .map_err(|e| Error::Ipc(format!("cannot connect to {}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream.try_clone()?);
        let mut connection = Self {
            stream,
            reader,
            writer,
            address,
        };

        let hello = EngineRequest::Hello {
            token: config.credentials.token().to_string(),
        };
        match connection.request(&hello) {
            Ok(EngineResponse::Ready) => Ok(connection),
            Ok(EngineResponse::Denied { reason }) => Err(Error::Ipc(format!(
                "{} refused the connection: {}",
                connection.address, reason
            ))),
            Ok(other) => Err(Error::Ipc(format!(
                "unexpected handshake response from {}: {:?}",
                connection.address, other
            ))),
            Err(fault) => Err(Error::Ipc(format!(
                "handshake with {} failed: {}",
                connection.address, fault
            ))),
        }
    }

    fn request(&mut self, request: &EngineRequest) -> std::result::Result<EngineResponse, EngineFault> {
        write_message(&mut self.writer, request).map_err(transport)?;
        read_message(&mut self.reader).map_err(transport)
    }

    fn unexpected(&self, response: EngineResponse) -> EngineFault {
        EngineFault::Transport(format!(
            "unexpected response from {}: {:?}",
            self.address, response
        ))
    }
}

fn transport(e: Error) -> EngineFault {
    EngineFault::Transport(e.to_string())
}

impl EngineConnection for TcpConnection {
    fn eval(&mut self, code: &str) -> std::result::Result<Value, EngineFault> {
        match self.request(&EngineRequest::Eval {
            code: code.to_string(),
        })? {
            EngineResponse::Value { value } => Ok(value),
            EngineResponse::Fault { message } => Err(EngineFault::Eval(message)),
            other => Err(self.unexpected(other)),
        }
    }

    fn assign(&mut self, name: &str, value: Value) -> std::result::Result<(), EngineFault> {
        match self.request(&EngineRequest::Assign {
            name: name.to_string(),
            value,
        })? {
            EngineResponse::Done => Ok(()),
            EngineResponse::Fault { message } => Err(EngineFault::Eval(message)),
            other => Err(self.unexpected(other)),
        }
    }

    fn collect(&mut self, name: &str) -> std::result::Result<Value, EngineFault> {
        match self.request(&EngineRequest::Collect {
            name: name.to_string(),
        })? {
            EngineResponse::Value { value } => Ok(value),
            EngineResponse::Fault { message } => Err(EngineFault::Eval(message)),
            other => Err(self.unexpected(other)),
        }
    }

    fn spawn_worker(&mut self) -> std::result::Result<SpawnedWorker, EngineFault> {
        match self.request(&EngineRequest::SpawnWorker)? {
            EngineResponse::Spawned { port, pid } => Ok(SpawnedWorker { port, pid }),
            EngineResponse::Fault { message } => Err(EngineFault::Eval(message)),
            other => Err(self.unexpected(other)),
        }
    }

    fn shutdown(&mut self) {
        match self.request(&EngineRequest::Shutdown) {
            Ok(EngineResponse::ShuttingDown) => {}
            Ok(other) => tracing::debug!("{} answered shutdown with {:?}", self.address, other),
            Err(fault) => tracing::debug!("shutdown of {} failed: {}", self.address, fault),
        }
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
