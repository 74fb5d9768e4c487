//! Protocol stream: owns the transport, frames incoming bytes into backend
//! messages and writes encoded frontend messages.
//!
//! The read loop is the only driver of a connection. Every decoded message
//! invokes exactly one [`ProtocolCallbacks`] method; a transport or decode
//! failure invokes `on_throwable` once and stops the loop.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::error::{PgError, PgResult};
use super::protocol::{
    Authentication, BackendMessage, ErrorFields, FieldDescription, FrontendMessage, RowValues,
    TransactionStatus, HEADER_LEN, MAX_MESSAGE_LEN,
};

/// Requests from connection handles to the read loop.
#[derive(Debug)]
pub enum Command {
    /// Write pre-encoded frames in one go.
    Send(BytesMut),
    /// Send Terminate, shut the transport down and stop the loop.
    Close,
}

/// Receiver of decoded backend messages.
pub trait ProtocolCallbacks {
    fn on_authentication(&mut self, auth: Authentication);
    fn on_row_description(&mut self, fields: Vec<FieldDescription>);
    fn on_data_row(&mut self, values: RowValues);
    fn on_command_complete(&mut self, tag: String);
    fn on_error_response(&mut self, fields: ErrorFields);
    fn on_ready_for_query(&mut self, status: TransactionStatus);

    /// Transport or decode failure. The loop stops afterwards.
    fn on_throwable(&mut self, error: PgError);

    /// The loop has stopped. Called exactly once, last.
    fn on_closed(&mut self);

    fn on_parameter_status(&mut self, _name: String, _value: String) {}
    fn on_backend_key_data(&mut self, _process_id: i32, _secret_key: i32) {}
    fn on_notice(&mut self, _fields: ErrorFields) {}

    /// Messages without a dedicated callback.
    fn on_other(&mut self, message: BackendMessage) {
        trace!(tag = %char::from(message.tag()), "ignoring backend message");
    }
}

/// Buffered transport plus the partially received frame.
pub struct PgStream<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: BufWriter<WriteHalf<T>>,
    read_buffer: BytesMut,
}

impl<T> PgStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(transport: T) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            read_buffer: BytesMut::with_capacity(32768),
        }
    }

    /// Send the startup message, then dispatch backend messages and execute
    /// commands until the connection ends.
    pub async fn run<C>(
        mut self,
        startup: FrontendMessage,
        callbacks: &mut C,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) where
        C: ProtocolCallbacks,
    {
        let mut frame = BytesMut::new();
        startup.encode(&mut frame);
        match self.send(&frame).await {
            Ok(()) => debug!("startup message sent"),
            Err(e) => {
                callbacks.on_throwable(e);
                callbacks.on_closed();
                return;
            }
        }

        loop {
            tokio::select! {
                // Commands first, so a close requested by a callback wins over
                // frames that are already buffered.
                biased;

                command = commands.recv() => match command {
                    Some(Command::Send(frames)) => {
                        trace!(bytes = frames.len(), "sending frames");
                        if let Err(e) = self.send(&frames).await {
                            callbacks.on_throwable(e);
                            break;
                        }
                    }
                    Some(Command::Close) | None => {
                        self.close().await;
                        break;
                    }
                },
                message = self.receive_message() => match message {
                    Ok(message) => dispatch(message, callbacks),
                    Err(e) => {
                        callbacks.on_throwable(e);
                        break;
                    }
                },
            }
        }

        debug!("connection closed");
        callbacks.on_closed();
    }

    /// Write and flush.
    async fn send(&mut self, frames: &[u8]) -> PgResult<()> {
        self.writer.write_all(frames).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive one backend message. Cancel safe: bytes already read stay in
    /// `read_buffer`.
    async fn receive_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            if self.read_buffer.len() >= HEADER_LEN {
                let length = i32::from_be_bytes([
                    self.read_buffer[1],
                    self.read_buffer[2],
                    self.read_buffer[3],
                    self.read_buffer[4],
                ]);
                let length = usize::try_from(length)
                    .ok()
                    .filter(|len| (4..=MAX_MESSAGE_LEN).contains(len))
                    .ok_or_else(|| {
                        PgError::protocol(format!("Invalid message length: {}", length))
                    })?;

                // Tag byte plus the length, which counts itself
                let total_len = 1 + length;
                if self.read_buffer.len() >= total_len {
                    let frame = self.read_buffer.split_to(total_len);
                    let message = BackendMessage::decode(&mut Bytes::from(frame))?;
                    trace!(?message, "received");
                    return Ok(message);
                }
                self.read_buffer.reserve(total_len - self.read_buffer.len());
            }

            let mut buf = [0u8; 4096];
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                return Err(PgError::ConnectionClosed);
            }
            self.read_buffer.extend_from_slice(&buf[..n]);
        }
    }

    /// Best effort: the peer may already be gone.
    async fn close(&mut self) {
        let mut frame = BytesMut::new();
        FrontendMessage::Terminate.encode(&mut frame);
        if let Err(e) = self.send(&frame).await {
            debug!(error = %e, "failed to send terminate");
        }
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "failed to shut down transport");
        }
    }
}

fn dispatch<C: ProtocolCallbacks>(message: BackendMessage, callbacks: &mut C) {
    match message {
        BackendMessage::Authentication(auth) => callbacks.on_authentication(auth),
        BackendMessage::RowDescription { fields } => callbacks.on_row_description(fields),
        BackendMessage::DataRow { values } => callbacks.on_data_row(values),
        BackendMessage::CommandComplete { tag } => callbacks.on_command_complete(tag),
        BackendMessage::ErrorResponse(fields) => callbacks.on_error_response(fields),
        BackendMessage::ReadyForQuery { status } => callbacks.on_ready_for_query(status),
        BackendMessage::ParameterStatus { name, value } => {
            callbacks.on_parameter_status(name, value)
        }
        BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        } => callbacks.on_backend_key_data(process_id, secret_key),
        BackendMessage::NoticeResponse(fields) => callbacks.on_notice(fields),
        other => callbacks.on_other(other),
    }
}
