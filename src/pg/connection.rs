//! PostgreSQL connection.
//!
//! A connection is a spawned task that owns the transport and a
//! [`Dispatcher`], plus any number of cloneable [`Connection`] handles.
//! Handles talk to the task through a command channel and share one
//! pending-operation slot with it:
//!
//! - issuing an operation is a check-and-set on the slot, so a second
//!   operation is rejected synchronously with `OperationInProgress`
//! - completing an operation takes the slot (and the result being built)
//!   before any handler runs, so a handler may issue the next operation
//! - the startup handshake occupies the slot until the first ReadyForQuery
//!
//! Every operation comes in a callback form and a future form.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::auth::{md5_password, ScramClient, SCRAM_SHA_256};
use super::config::PgConfig;
use super::error::{BoxError, HandlerResult, PgError, PgResult};
use super::protocol::{
    Authentication, BackendMessage, DescribeTarget, ErrorFields, FieldDescription,
    FrontendMessage, RowValues, TransactionStatus, MAX_PARAMS,
};
use super::result::{ResultBuilder, ResultSet};
use super::stream::{Command, PgStream, ProtocolCallbacks};
use super::transaction::Transaction;
use super::types::Value;

/// Error handler of an operation.
pub type ErrorHandler = Box<dyn FnOnce(PgError) + Send + 'static>;

type ResultHandler = Box<dyn FnOnce(ResultSet) -> HandlerResult + Send + 'static>;
type ConnectedHandler = Box<dyn FnOnce(Connection) -> HandlerResult + Send + 'static>;

// ============================================================================
// Handler Dispatch
// ============================================================================

/// Deliver `error` to `on_error`, or log it when there is no handler.
///
/// A panicking error handler is logged and never re-thrown.
pub(crate) fn invoke_on_error(on_error: Option<ErrorHandler>, error: PgError) {
    match on_error {
        Some(handler) => {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(move || handler(error))) {
                error!(panic = %panic_message(&*panic), "error handler panicked");
            }
        }
        None => error!(error = %error, "unhandled error"),
    }
}

/// Run a success handler, turning a panic into an error.
fn guard(handler: impl FnOnce() -> HandlerResult) -> HandlerResult {
    catch_unwind(AssertUnwindSafe(handler))
        .unwrap_or_else(|panic| Err(BoxError::from(panic_message(&*panic))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Completion target of a query.
enum Responder {
    Callbacks {
        on_result: ResultHandler,
        on_error: ErrorHandler,
    },
    Channel(oneshot::Sender<PgResult<ResultSet>>),
}

impl Responder {
    fn callbacks<R, E>(on_result: R, on_error: E) -> Self
    where
        R: FnOnce(ResultSet) -> HandlerResult + Send + 'static,
        E: FnOnce(PgError) + Send + 'static,
    {
        Responder::Callbacks {
            on_result: Box::new(on_result),
            on_error: Box::new(on_error),
        }
    }

    fn succeed(self, result: ResultSet) {
        match self {
            Responder::Callbacks {
                on_result,
                on_error,
            } => {
                if let Err(e) = guard(move || on_result(result)) {
                    invoke_on_error(Some(on_error), PgError::Handler(e));
                }
            }
            Responder::Channel(tx) => {
                // The caller stopped waiting
                let _ = tx.send(Ok(result));
            }
        }
    }

    fn fail(self, error: PgError) {
        match self {
            Responder::Callbacks { on_error, .. } => invoke_on_error(Some(on_error), error),
            Responder::Channel(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

/// Completion target of the startup handshake.
enum ConnectResponder {
    Callbacks {
        on_connected: ConnectedHandler,
        on_error: ErrorHandler,
    },
    Channel(oneshot::Sender<PgResult<Connection>>),
}

impl ConnectResponder {
    fn succeed(self, conn: Connection) {
        match self {
            ConnectResponder::Callbacks {
                on_connected,
                on_error,
            } => {
                if let Err(e) = guard(move || on_connected(conn)) {
                    invoke_on_error(Some(on_error), PgError::Handler(e));
                }
            }
            ConnectResponder::Channel(tx) => {
                let _ = tx.send(Ok(conn));
            }
        }
    }

    fn fail(self, error: PgError) {
        match self {
            ConnectResponder::Callbacks { on_error, .. } => invoke_on_error(Some(on_error), error),
            ConnectResponder::Channel(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

/// The operation in flight.
enum Pending {
    /// Startup handshake. Holds a handle so the loop outlives it.
    Connect {
        conn: Connection,
        responder: ConnectResponder,
    },
    /// Query or transaction step. The handle keeps the loop running until
    /// the operation completes, even when the caller kept none.
    Query {
        conn: Connection,
        responder: Responder,
    },
}

impl Pending {
    fn fail(self, error: PgError) {
        match self {
            Pending::Connect { responder, .. } => responder.fail(error),
            Pending::Query { responder, .. } => responder.fail(error),
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Default)]
struct Session {
    parameters: HashMap<String, String>,
    backend_pid: i32,
    transaction_status: Option<TransactionStatus>,
}

#[derive(Default)]
struct State {
    pending: Mutex<Option<Pending>>,
    closed: AtomicBool,
    session: Mutex<Session>,
}

impl State {
    fn take_pending(&self) -> Option<Pending> {
        self.pending.lock().take()
    }

    fn fail_pending(&self, error: PgError) {
        // Lock released before the handler runs
        let pending = self.take_pending();
        if let Some(pending) = pending {
            pending.fail(error);
        }
    }
}

// ============================================================================
// Connection Handle
// ============================================================================

/// Handle to a PostgreSQL connection.
///
/// Cheap to clone; all clones drive the same session. At most one query or
/// transaction step runs at a time.
#[derive(Clone)]
pub struct Connection {
    state: Arc<State>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    /// Start the handshake over `transport` and return immediately.
    ///
    /// `on_connected` runs once the server is ready for queries, `on_error`
    /// if the handshake fails. Must be called within a Tokio runtime.
    pub fn open<T, F, E>(transport: T, config: &PgConfig, on_connected: F, on_error: E) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: FnOnce(Connection) -> HandlerResult + Send + 'static,
        E: FnOnce(PgError) + Send + 'static,
    {
        Self::spawn(
            transport,
            config,
            ConnectResponder::Callbacks {
                on_connected: Box::new(on_connected),
                on_error: Box::new(on_error),
            },
        )
    }

    /// Connect over TCP and wait until the server is ready for queries.
    ///
    /// `connect_timeout` covers the TCP connect and the handshake.
    pub async fn connect(config: &PgConfig) -> PgResult<Self> {
        let deadline = config.connect_timeout.map(|limit| Instant::now() + limit);

        let connecting = TcpStream::connect(config.address());
        let stream = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, connecting)
                .await
                .map_err(|_| PgError::Timeout)??,
            None => connecting.await?,
        };
        stream.set_nodelay(true)?;
        debug!(address = %config.address(), "tcp connected");

        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        Self::handshake(stream, config, remaining).await
    }

    /// Run the handshake over an already established transport.
    pub async fn connect_with<T>(transport: T, config: &PgConfig) -> PgResult<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::handshake(transport, config, config.connect_timeout).await
    }

    async fn handshake<T>(
        transport: T,
        config: &PgConfig,
        limit: Option<Duration>,
    ) -> PgResult<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let conn = Self::spawn(transport, config, ConnectResponder::Channel(tx));

        let outcome = match limit {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    conn.close();
                    return Err(PgError::Timeout);
                }
            },
            None => rx.await,
        };
        outcome.unwrap_or(Err(PgError::ConnectionClosed))
    }

    fn spawn<T>(transport: T, config: &PgConfig, responder: ConnectResponder) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection {
            state: Arc::new(State::default()),
            commands: tx,
        };
        *conn.state.pending.lock() = Some(Pending::Connect {
            conn: conn.clone(),
            responder,
        });

        let mut dispatcher =
            Dispatcher::new(Arc::clone(&conn.state), conn.commands.downgrade(), config);
        let startup = config.startup_message();
        let stream = PgStream::new(transport);

        tokio::spawn(async move {
            stream.run(startup, &mut dispatcher, rx).await;
            // Operations that raced into the slot while the loop was stopping
            dispatcher.state.closed.store(true, Ordering::Release);
            dispatcher.state.fail_pending(PgError::ConnectionClosed);
        });

        conn
    }

    /// Run a simple query.
    pub fn query<R, E>(&self, sql: &str, on_result: R, on_error: E)
    where
        R: FnOnce(ResultSet) -> HandlerResult + Send + 'static,
        E: FnOnce(PgError) + Send + 'static,
    {
        self.submit(frames(sql, &[]), Responder::callbacks(on_result, on_error));
    }

    /// Run a parameterized query through the extended protocol.
    ///
    /// With no parameters this is the same as [`Connection::query`].
    pub fn query_params<R, E>(&self, sql: &str, params: &[Value], on_result: R, on_error: E)
    where
        R: FnOnce(ResultSet) -> HandlerResult + Send + 'static,
        E: FnOnce(PgError) + Send + 'static,
    {
        self.submit(frames(sql, params), Responder::callbacks(on_result, on_error));
    }

    /// Run a query and wait for its result.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> PgResult<ResultSet> {
        let (tx, rx) = oneshot::channel();
        self.submit(frames(sql, params), Responder::Channel(tx));
        rx.await.unwrap_or(Err(PgError::ConnectionClosed))
    }

    /// Issue `BEGIN`; `on_transaction` receives this connection and the
    /// transaction bound to it.
    pub fn begin<F, E>(&self, on_transaction: F, on_error: E)
    where
        F: FnOnce(Connection, Transaction) -> HandlerResult + Send + 'static,
        E: FnOnce(PgError) + Send + 'static,
    {
        let conn = self.clone();
        self.query(
            "BEGIN",
            move |_| on_transaction(conn.clone(), Transaction::new(conn)),
            on_error,
        );
    }

    /// Issue `BEGIN` and wait for the transaction.
    pub async fn transaction(&self) -> PgResult<Transaction> {
        self.execute("BEGIN", &[]).await?;
        Ok(Transaction::new(self.clone()))
    }

    /// Close the connection. An operation still in flight fails with
    /// `ConnectionClosed`; later operations fail the same way immediately.
    pub fn close(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing connection");
        // The loop may already be gone
        let _ = self.commands.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Server parameter reported during startup (e.g. `server_version`).
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.state.session.lock().parameters.get(name).cloned()
    }

    /// Backend process ID, 0 until the server reported it.
    pub fn backend_pid(&self) -> i32 {
        self.state.session.lock().backend_pid
    }

    /// Transaction status from the last ReadyForQuery.
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        self.state.session.lock().transaction_status
    }

    /// Claim the pending slot and hand the frames to the loop.
    fn submit(&self, frames: PgResult<BytesMut>, responder: Responder) {
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => return responder.fail(e),
        };
        if self.is_closed() {
            return responder.fail(PgError::ConnectionClosed);
        }

        let rejected = {
            let mut slot = self.state.pending.lock();
            if slot.is_some() {
                Some(responder)
            } else {
                *slot = Some(Pending::Query {
                    conn: self.clone(),
                    responder,
                });
                None
            }
        };
        if let Some(responder) = rejected {
            return responder.fail(PgError::OperationInProgress);
        }

        if self.commands.send(Command::Send(frames)).is_err() {
            // The loop stopped after the closed check
            self.state.fail_pending(PgError::ConnectionClosed);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("backend_pid", &self.backend_pid())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Encode a query: a simple Query without parameters, otherwise
/// Parse/Bind/Describe/Execute/Sync with text-format parameters.
fn frames(sql: &str, params: &[Value]) -> PgResult<BytesMut> {
    let mut buf = BytesMut::new();
    if params.is_empty() {
        FrontendMessage::Query {
            sql: sql.to_string(),
        }
        .encode(&mut buf);
        return Ok(buf);
    }
    if params.len() > MAX_PARAMS {
        return Err(PgError::TooManyParameters(params.len()));
    }

    let messages = [
        FrontendMessage::Parse {
            name: String::new(),
            sql: sql.to_string(),
            param_types: Vec::new(),
        },
        FrontendMessage::Bind {
            portal: String::new(),
            statement: String::new(),
            param_formats: Vec::new(),
            params: params.iter().map(Value::encode_text).collect(),
            result_formats: Vec::new(),
        },
        FrontendMessage::Describe {
            target: DescribeTarget::Portal,
            name: String::new(),
        },
        FrontendMessage::Execute {
            portal: String::new(),
            max_rows: 0,
        },
        FrontendMessage::Sync,
    ];
    for message in &messages {
        message.encode(&mut buf);
    }
    Ok(buf)
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Loop-owned state: reacts to backend messages on behalf of the handles.
struct Dispatcher {
    state: Arc<State>,
    /// Weak: the loop stops once no handle and no pending operation holds
    /// a sender
    commands: mpsc::WeakUnboundedSender<Command>,
    /// Credentials, cleared once authentication completes
    user: Option<String>,
    password: Option<String>,
    scram: Option<ScramClient>,
    result: Option<ResultBuilder>,
    /// The ReadyForQuery of an operation already failed by ErrorResponse
    /// is still to come
    drain_ready: bool,
}

impl Dispatcher {
    fn new(
        state: Arc<State>,
        commands: mpsc::WeakUnboundedSender<Command>,
        config: &PgConfig,
    ) -> Self {
        Self {
            state,
            commands,
            user: Some(config.user.clone()),
            password: config.password.clone(),
            scram: None,
            result: None,
            drain_ready: false,
        }
    }

    fn command(&self, command: Command) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(command);
        }
    }

    fn reply(&self, message: FrontendMessage) {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        self.command(Command::Send(buf));
    }

    /// Fail the operation in flight and stop the connection.
    fn fatal(&mut self, error: PgError) {
        self.result = None;
        self.state.closed.store(true, Ordering::Release);
        match self.state.take_pending() {
            Some(pending) => pending.fail(error),
            None => invoke_on_error(None, error),
        }
        self.command(Command::Close);
    }

    fn user(&self) -> &str {
        self.user.as_deref().unwrap_or_default()
    }

    fn take_password(&mut self) -> Option<String> {
        let password = self.password.take();
        if password.is_none() {
            self.fatal(PgError::Auth("Password required".to_string()));
        }
        password
    }

    fn authenticate(&mut self, auth: Authentication) -> PgResult<()> {
        match auth {
            Authentication::Ok => {
                debug!("authenticated");
                self.user = None;
                self.password = None;
                self.scram = None;
            }
            Authentication::CleartextPassword => {
                if let Some(password) = self.take_password() {
                    self.reply(FrontendMessage::Password { password });
                }
            }
            Authentication::Md5Password { salt } => {
                if let Some(password) = self.take_password() {
                    let password = md5_password(self.user(), &password, &salt);
                    self.reply(FrontendMessage::Password { password });
                }
            }
            Authentication::Sasl { mechanisms } => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PgError::Auth(format!(
                        "Unsupported SASL mechanisms: {:?}",
                        mechanisms
                    )));
                }
                if let Some(password) = self.take_password() {
                    let scram = ScramClient::new(self.user(), &password);
                    self.reply(FrontendMessage::SaslInitialResponse {
                        mechanism: SCRAM_SHA_256.to_string(),
                        data: scram.client_first(),
                    });
                    self.scram = Some(scram);
                }
            }
            Authentication::SaslContinue { data } => {
                let scram = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| PgError::protocol("SASL continue without SASL exchange"))?;
                let data = scram
                    .server_first(&data)
                    .map_err(|e| PgError::Auth(e.to_string()))?;
                self.reply(FrontendMessage::SaslResponse { data });
            }
            Authentication::SaslFinal { data } => {
                let mut scram = self
                    .scram
                    .take()
                    .ok_or_else(|| PgError::protocol("SASL final without SASL exchange"))?;
                scram
                    .server_final(&data)
                    .map_err(|e| PgError::Auth(e.to_string()))?;
            }
        }
        Ok(())
    }
}

impl ProtocolCallbacks for Dispatcher {
    fn on_authentication(&mut self, auth: Authentication) {
        if let Err(e) = self.authenticate(auth) {
            self.fatal(e);
        }
    }

    fn on_row_description(&mut self, fields: Vec<FieldDescription>) {
        self.result = Some(ResultBuilder::new(fields));
    }

    fn on_data_row(&mut self, values: RowValues) {
        match self.result.as_mut() {
            Some(result) => result.push_row(values),
            None => self.fatal(PgError::protocol("DataRow without RowDescription")),
        }
    }

    fn on_command_complete(&mut self, tag: String) {
        self.result
            .get_or_insert_with(ResultBuilder::empty)
            .complete(tag);
    }

    fn on_error_response(&mut self, fields: ErrorFields) {
        let error = PgError::from(&fields);
        self.result = None;
        match self.state.take_pending() {
            Some(Pending::Connect { responder, .. }) => {
                debug!(error = %error, "startup failed");
                self.state.closed.store(true, Ordering::Release);
                self.command(Command::Close);
                responder.fail(error);
            }
            Some(Pending::Query { responder, .. }) => {
                // Set before the handler can issue the next operation
                self.drain_ready = true;
                responder.fail(error);
            }
            None => invoke_on_error(None, error),
        }
    }

    fn on_ready_for_query(&mut self, status: TransactionStatus) {
        self.state.session.lock().transaction_status = Some(status);
        if std::mem::take(&mut self.drain_ready) {
            trace!("ready after failed operation");
            return;
        }

        let result = self.result.take();
        match self.state.take_pending() {
            Some(Pending::Connect { conn, responder }) => {
                debug!("ready for query");
                responder.succeed(conn);
            }
            Some(Pending::Query { responder, .. }) => {
                let result = result.unwrap_or_else(ResultBuilder::empty).finish();
                responder.succeed(result);
            }
            None => trace!("ready with no operation pending"),
        }
    }

    fn on_throwable(&mut self, error: PgError) {
        self.fatal(error);
    }

    fn on_closed(&mut self) {
        self.result = None;
        self.scram = None;
        self.user = None;
        self.password = None;
        self.state.closed.store(true, Ordering::Release);
        self.state.fail_pending(PgError::ConnectionClosed);
    }

    fn on_parameter_status(&mut self, name: String, value: String) {
        trace!(%name, %value, "parameter status");
        self.state.session.lock().parameters.insert(name, value);
    }

    fn on_backend_key_data(&mut self, process_id: i32, _secret_key: i32) {
        self.state.session.lock().backend_pid = process_id;
    }

    fn on_notice(&mut self, fields: ErrorFields) {
        let severity = fields.severity().unwrap_or_default();
        let message = fields.message().unwrap_or_default();
        if severity == "WARNING" {
            warn!(%severity, %message, "server notice");
        } else {
            info!(%severity, %message, "server notice");
        }
    }

    fn on_other(&mut self, message: BackendMessage) {
        match message {
            BackendMessage::EmptyQueryResponse => {
                self.result.get_or_insert_with(ResultBuilder::empty);
            }
            other => trace!(tag = %char::from(other.tag()), "ignoring backend message"),
        }
    }
}
