//! End-to-end protocol tests
//!
//! Each test drives a full connection over an in-memory duplex stream with a
//! raw client built on the crate's own codec.

use bytes::{Bytes, BytesMut};
use pgbridge_common::config::{AuthMethodKind, HbaRule, SslRequirement};
use pgbridge_server::auth::{HostBasedAuthentication, StaticPasswordProvider};
use pgbridge_server::backend::{
    ColumnMetadata, ConstantSessionHandler, PreparedStatement, ResultSet, SessionHandler, Statement, VecResultSet,
};
use pgbridge_server::pg_wire::protocol::constants::{GSSENC_REQUEST_CODE, SSL_REQUEST_CODE};
use pgbridge_server::pg_wire::protocol::messages::{
    encode_cancel_request, encode_request_code, BackendMessage, FrontendMessage, StartupMessage, Target,
};
use pgbridge_server::pg_wire::protocol::types::{PgType, Value};
use pgbridge_server::{serve_connection, PgWireConfig, ServerContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Data backend keyed on the table named in the SQL text.
///
/// `slow` sleeps before producing its row, `broken` sleeps and then fails,
/// `endless` never runs out of rows.
struct TableBackend;

struct TableStatement {
    table: String,
}

impl TableStatement {
    fn for_sql(sql: &str) -> Self {
        let table = sql
            .split_whitespace()
            .skip_while(|w| !w.eq_ignore_ascii_case("from"))
            .nth(1)
            .unwrap_or("")
            .trim_end_matches(';')
            .to_string();
        Self { table }
    }

    fn columns(&self) -> Vec<ColumnMetadata> {
        vec![ColumnMetadata::new("source", PgType::Text)]
    }

    fn run(&self) -> anyhow::Result<Box<dyn ResultSet>> {
        match self.table.as_str() {
            "slow" => {
                std::thread::sleep(Duration::from_millis(300));
                Ok(Box::new(VecResultSet::new(self.columns(), vec![vec![Value::Text("slow".into())]])))
            }
            "fast" => Ok(Box::new(VecResultSet::new(self.columns(), vec![vec![Value::Text("fast".into())]]))),
            "broken" => {
                std::thread::sleep(Duration::from_millis(200));
                anyhow::bail!("storage for \"broken\" is unreadable")
            }
            "endless" => Ok(Box::new(Endless { columns: self.columns() })),
            other => anyhow::bail!("relation \"{}\" does not exist", other),
        }
    }
}

struct Endless {
    columns: Vec<ColumnMetadata>,
}

impl ResultSet for Endless {
    fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    fn next_row(&mut self) -> anyhow::Result<Option<Vec<Value>>> {
        std::thread::sleep(Duration::from_millis(2));
        Ok(Some(vec![Value::Text("more".into())]))
    }
}

impl PreparedStatement for TableStatement {
    fn result_columns(&self) -> anyhow::Result<Option<Vec<ColumnMetadata>>> {
        Ok(Some(self.columns()))
    }

    fn set_parameter(&self, index: usize, _value: Value) -> anyhow::Result<()> {
        anyhow::bail!("unexpected parameter ${}", index + 1)
    }

    fn execute(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn result_set(&self) -> anyhow::Result<Box<dyn ResultSet>> {
        self.run()
    }
}

struct TableOneShot {
    statement: Option<TableStatement>,
}

impl Statement for TableOneShot {
    fn execute(&mut self, sql: &str) -> anyhow::Result<bool> {
        self.statement = Some(TableStatement::for_sql(sql));
        Ok(true)
    }

    fn result_set(&mut self) -> anyhow::Result<Box<dyn ResultSet>> {
        match &self.statement {
            Some(statement) => statement.run(),
            None => anyhow::bail!("statement was not executed"),
        }
    }
}

impl SessionHandler for TableBackend {
    fn name(&self) -> &str {
        "tables"
    }

    fn prepare_statement(&self, sql: &str) -> anyhow::Result<Arc<dyn PreparedStatement>> {
        Ok(Arc::new(TableStatement::for_sql(sql)))
    }

    fn create_statement(&self) -> anyhow::Result<Box<dyn Statement>> {
        Ok(Box::new(TableOneShot { statement: None }))
    }
}

fn rule(method: AuthMethodKind) -> HbaRule {
    HbaRule {
        user: None,
        address: None,
        ssl: SslRequirement::Any,
        method,
    }
}

fn context_with(rules: &[HbaRule], send_backend_key_data: bool) -> Arc<ServerContext> {
    let users = StaticPasswordProvider::new();
    users.register_user("alice", "secret");
    let auth = HostBasedAuthentication::new(rules, Arc::new(users)).unwrap();
    let config = PgWireConfig {
        worker_threads: 4,
        result_flush_rows: 2,
        send_backend_key_data,
        ..PgWireConfig::default()
    };
    Arc::new(ServerContext::new(
        config,
        Arc::new(TableBackend),
        Arc::new(ConstantSessionHandler),
        Arc::new(auth),
    ))
}

fn trust_context() -> Arc<ServerContext> {
    context_with(&[rule(AuthMethodKind::Trust)], false)
}

struct Client {
    io: DuplexStream,
    buf: BytesMut,
}

impl Client {
    fn connect(context: Arc<ServerContext>) -> Self {
        let (io, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = serve_connection(server, None, context).await;
        });
        Self {
            io,
            buf: BytesMut::new(),
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }

    async fn send(&mut self, messages: &[FrontendMessage]) {
        let mut buf = BytesMut::new();
        for message in messages {
            message.encode(&mut buf);
        }
        self.send_raw(&buf).await;
    }

    async fn startup(&mut self, user: &str) {
        let mut buf = BytesMut::new();
        StartupMessage::new(&[("user", user), ("database", "analytics")]).encode(&mut buf);
        self.send_raw(&buf).await;
    }

    async fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(TIMEOUT, self.io.read(&mut chunk))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        self.buf.extend_from_slice(&chunk[..n]);
        n
    }

    async fn recv(&mut self) -> BackendMessage {
        loop {
            if let Some(message) = BackendMessage::decode(&mut self.buf).unwrap() {
                return message;
            }
            assert!(self.fill().await > 0, "connection closed unexpectedly");
        }
    }

    async fn recv_byte(&mut self) -> u8 {
        while self.buf.is_empty() {
            assert!(self.fill().await > 0, "connection closed unexpectedly");
        }
        self.buf.split_to(1)[0]
    }

    /// Messages up to and including the next ReadyForQuery
    async fn until_ready(&mut self) -> Vec<BackendMessage> {
        let mut out = Vec::new();
        loop {
            let message = self.recv().await;
            let done = matches!(message, BackendMessage::ReadyForQuery(_));
            out.push(message);
            if done {
                return out;
            }
        }
    }

    async fn is_closed(&mut self) -> bool {
        self.buf.is_empty() && self.fill().await == 0
    }

    /// Trusted login, returning the greeting
    async fn login(context: Arc<ServerContext>) -> (Self, Vec<BackendMessage>) {
        let mut client = Self::connect(context);
        client.startup("alice").await;
        let greeting = client.until_ready().await;
        (client, greeting)
    }
}

fn text(value: &str) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(value.as_bytes()))
}

fn error_code(message: &BackendMessage) -> &str {
    match message {
        BackendMessage::ErrorResponse(fields) => &fields.code,
        other => panic!("expected ErrorResponse, got {:?}", other),
    }
}

#[tokio::test]
async fn test_password_startup_sequence() {
    let mut client = Client::connect(context_with(&[rule(AuthMethodKind::Password)], false));
    client.startup("alice").await;
    assert_eq!(client.recv().await, BackendMessage::AuthenticationCleartextPassword);

    client.send(&[FrontendMessage::password("secret")]).await;
    let greeting = client.until_ready().await;
    assert_eq!(greeting[0], BackendMessage::AuthenticationOk);
    let statuses: Vec<(String, String)> = greeting[1..7]
        .iter()
        .map(|m| match m {
            BackendMessage::ParameterStatus { name, value } => (name.clone(), value.clone()),
            other => panic!("expected ParameterStatus, got {:?}", other),
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("server_version".to_string(), "10.5".to_string()),
            ("server_encoding".to_string(), "UTF8".to_string()),
            ("client_encoding".to_string(), "UTF8".to_string()),
            ("DateStyle".to_string(), "ISO".to_string()),
            ("TimeZone".to_string(), "UTC".to_string()),
            ("integer_datetimes".to_string(), "on".to_string()),
        ]
    );
    assert_eq!(greeting[7], BackendMessage::ReadyForQuery(b'I'));
    assert_eq!(greeting.len(), 8);
}

#[tokio::test]
async fn test_wrong_password_is_fatal() {
    let mut client = Client::connect(context_with(&[rule(AuthMethodKind::Password)], false));
    client.startup("alice").await;
    assert_eq!(client.recv().await, BackendMessage::AuthenticationCleartextPassword);
    client.send(&[FrontendMessage::password("wrong")]).await;

    match client.recv().await {
        BackendMessage::ErrorResponse(fields) => {
            assert_eq!(fields.severity, "FATAL");
            assert_eq!(fields.code, "28P01");
            assert_eq!(fields.message, "password authentication failed for user \"alice\"");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn test_no_matching_rule() {
    let rules = [HbaRule {
        ssl: SslRequirement::Required,
        ..rule(AuthMethodKind::Password)
    }];
    let mut client = Client::connect(context_with(&rules, false));
    client.startup("alice").await;
    match client.recv().await {
        BackendMessage::ErrorResponse(fields) => {
            assert_eq!(fields.severity, "FATAL");
            assert_eq!(fields.code, "28000");
            assert_eq!(fields.routine.as_deref(), Some("ClientAuthentication"));
            assert!(fields.message.contains("Did you enable TLS in your client?"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn test_ssl_and_gssenc_declined() {
    let mut client = Client::connect(trust_context());
    let mut buf = BytesMut::new();
    encode_request_code(GSSENC_REQUEST_CODE, &mut buf);
    client.send_raw(&buf).await;
    assert_eq!(client.recv_byte().await, b'N');

    buf.clear();
    encode_request_code(SSL_REQUEST_CODE, &mut buf);
    client.send_raw(&buf).await;
    assert_eq!(client.recv_byte().await, b'N');

    client.startup("alice").await;
    let greeting = client.until_ready().await;
    assert_eq!(greeting[0], BackendMessage::AuthenticationOk);
}

#[tokio::test]
async fn test_simple_query_with_two_statements() {
    let (mut client, _) = Client::login(trust_context()).await;
    client.send(&[FrontendMessage::Query("SELECT 1; SELECT 2".into())]).await;
    let messages = client.until_ready().await;

    assert_eq!(messages.len(), 7);
    assert!(matches!(messages[0], BackendMessage::RowDescription(_)));
    assert_eq!(messages[1], BackendMessage::DataRow(vec![text("1")]));
    assert_eq!(messages[2], BackendMessage::CommandComplete("SELECT 1".into()));
    assert!(matches!(messages[3], BackendMessage::RowDescription(_)));
    assert_eq!(messages[4], BackendMessage::DataRow(vec![text("2")]));
    assert_eq!(messages[5], BackendMessage::CommandComplete("SELECT 1".into()));
    assert_eq!(messages[6], BackendMessage::ReadyForQuery(b'I'));
}

#[tokio::test]
async fn test_empty_simple_query() {
    let (mut client, _) = Client::login(trust_context()).await;
    client.send(&[FrontendMessage::Query(";".into())]).await;
    assert_eq!(
        client.until_ready().await,
        vec![BackendMessage::EmptyQueryResponse, BackendMessage::ReadyForQuery(b'I')]
    );
}

#[tokio::test]
async fn test_simple_query_error_stops_batch() {
    let (mut client, _) = Client::login(trust_context()).await;
    client
        .send(&[FrontendMessage::Query("SELECT * FROM missing; SELECT 1".into())])
        .await;
    let messages = client.until_ready().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(error_code(&messages[0]), "XX000");
    assert!(matches!(&messages[0], BackendMessage::ErrorResponse(f) if f.message == "relation \"missing\" does not exist"));

    // The session is usable afterwards
    client.send(&[FrontendMessage::Query("BEGIN".into())]).await;
    assert_eq!(
        client.until_ready().await,
        vec![BackendMessage::CommandComplete("BEGIN".into()), BackendMessage::ReadyForQuery(b'I')]
    );
}

#[tokio::test]
async fn test_extended_query_with_parameters() {
    let (mut client, _) = Client::login(trust_context()).await;
    client
        .send(&[
            FrontendMessage::Parse {
                name: "s1".into(),
                query: "SELECT $1 AS greeting".into(),
                param_types: vec![],
            },
            FrontendMessage::Describe {
                target: Target::Statement,
                name: "s1".into(),
            },
            FrontendMessage::Bind {
                portal: "".into(),
                statement: "s1".into(),
                param_formats: vec![],
                params: vec![text("hi")],
                result_formats: vec![],
            },
            FrontendMessage::Execute {
                portal: "".into(),
                max_rows: 0,
            },
            FrontendMessage::Sync,
        ])
        .await;
    let messages = client.until_ready().await;

    assert_eq!(messages[0], BackendMessage::ParseComplete);
    assert_eq!(messages[1], BackendMessage::ParameterDescription(vec![PgType::Text.oid()]));
    match &messages[2] {
        BackendMessage::RowDescription(fields) => assert_eq!(fields[0].name, "greeting"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(messages[3], BackendMessage::BindComplete);
    assert_eq!(messages[4], BackendMessage::DataRow(vec![text("hi")]));
    assert_eq!(messages[5], BackendMessage::CommandComplete("SELECT 1".into()));
    assert_eq!(messages[6], BackendMessage::ReadyForQuery(b'I'));
}

#[tokio::test]
async fn test_empty_parse_gives_no_data_and_empty_response() {
    let (mut client, _) = Client::login(trust_context()).await;
    client
        .send(&[
            FrontendMessage::Parse {
                name: "".into(),
                query: "".into(),
                param_types: vec![],
            },
            FrontendMessage::Bind {
                portal: "".into(),
                statement: "".into(),
                param_formats: vec![],
                params: vec![],
                result_formats: vec![],
            },
            FrontendMessage::Describe {
                target: Target::Portal,
                name: "".into(),
            },
            FrontendMessage::Execute {
                portal: "".into(),
                max_rows: 0,
            },
            FrontendMessage::Sync,
        ])
        .await;
    assert_eq!(
        client.until_ready().await,
        vec![
            BackendMessage::ParseComplete,
            BackendMessage::BindComplete,
            BackendMessage::NoData,
            BackendMessage::EmptyQueryResponse,
            BackendMessage::ReadyForQuery(b'I'),
        ]
    );
}

#[tokio::test]
async fn test_error_skips_until_sync() {
    let (mut client, _) = Client::login(trust_context()).await;
    client
        .send(&[
            FrontendMessage::Parse {
                name: "s1".into(),
                query: "SELECT 1".into(),
                param_types: vec![],
            },
            FrontendMessage::Bind {
                portal: "".into(),
                statement: "nope".into(),
                param_formats: vec![],
                params: vec![],
                result_formats: vec![],
            },
            FrontendMessage::Execute {
                portal: "".into(),
                max_rows: 0,
            },
            FrontendMessage::Close {
                target: Target::Statement,
                name: "s1".into(),
            },
            FrontendMessage::Sync,
        ])
        .await;
    let messages = client.until_ready().await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0], BackendMessage::ParseComplete);
    assert_eq!(error_code(&messages[1]), "26000");
    assert_eq!(messages[2], BackendMessage::ReadyForQuery(b'I'));

    // Sync after an error cleared the session
    client
        .send(&[
            FrontendMessage::Describe {
                target: Target::Statement,
                name: "s1".into(),
            },
            FrontendMessage::Sync,
        ])
        .await;
    let messages = client.until_ready().await;
    assert_eq!(error_code(&messages[0]), "26000");
}

#[tokio::test]
async fn test_results_arrive_in_submission_order() {
    let (mut client, _) = Client::login(trust_context()).await;
    let mut batch = Vec::new();
    for (name, table) in [("slow", "slow"), ("fast", "fast")] {
        batch.push(FrontendMessage::Parse {
            name: name.into(),
            query: format!("SELECT source FROM {}", table),
            param_types: vec![],
        });
        batch.push(FrontendMessage::Bind {
            portal: name.into(),
            statement: name.into(),
            param_formats: vec![],
            params: vec![],
            result_formats: vec![],
        });
    }
    batch.push(FrontendMessage::Execute {
        portal: "slow".into(),
        max_rows: 0,
    });
    batch.push(FrontendMessage::Execute {
        portal: "fast".into(),
        max_rows: 0,
    });
    batch.push(FrontendMessage::Sync);
    client.send(&batch).await;

    assert_eq!(
        client.until_ready().await,
        vec![
            BackendMessage::ParseComplete,
            BackendMessage::BindComplete,
            BackendMessage::ParseComplete,
            BackendMessage::BindComplete,
            BackendMessage::DataRow(vec![text("slow")]),
            BackendMessage::CommandComplete("SELECT 1".into()),
            BackendMessage::DataRow(vec![text("fast")]),
            BackendMessage::CommandComplete("SELECT 1".into()),
            BackendMessage::ReadyForQuery(b'I'),
        ]
    );
}

fn parse_bind_execute(name: &str, table: &str) -> Vec<FrontendMessage> {
    vec![
        FrontendMessage::Parse {
            name: name.into(),
            query: format!("SELECT source FROM {}", table),
            param_types: vec![],
        },
        FrontendMessage::Bind {
            portal: name.into(),
            statement: name.into(),
            param_formats: vec![],
            params: vec![],
            result_formats: vec![],
        },
        FrontendMessage::Execute {
            portal: name.into(),
            max_rows: 0,
        },
    ]
}

/// The next cycle starts clean: a simple query gets exactly its own response
async fn assert_next_cycle_is_clean(client: &mut Client) {
    client
        .send(&[FrontendMessage::Query("SELECT source FROM fast".into())])
        .await;
    let messages = client.until_ready().await;
    assert!(
        matches!(messages[0], BackendMessage::RowDescription(_)),
        "unexpected {:?}",
        messages
    );
    assert_eq!(messages.len(), 4);
}

#[tokio::test]
async fn test_output_after_failed_execution_is_discarded() {
    let (mut client, _) = Client::login(trust_context()).await;
    let mut batch = parse_bind_execute("b", "broken");
    // Runs while `broken` is still sleeping and finishes long before it fails
    batch.extend(parse_bind_execute("f", "fast"));
    batch.push(FrontendMessage::Sync);
    client.send(&batch).await;

    let messages = client.until_ready().await;
    assert_eq!(messages.len(), 4, "unexpected {:?}", messages);
    assert_eq!(messages[0], BackendMessage::ParseComplete);
    assert_eq!(messages[1], BackendMessage::BindComplete);
    match &messages[2] {
        BackendMessage::ErrorResponse(fields) => assert!(fields.message.contains("unreadable")),
        other => panic!("expected ErrorResponse, got {:?}", other),
    }
    assert_eq!(messages[3], BackendMessage::ReadyForQuery(b'I'));

    assert_next_cycle_is_clean(&mut client).await;
}

#[tokio::test]
async fn test_each_sync_after_error_gets_one_ready() {
    let (mut client, _) = Client::login(trust_context()).await;
    let mut batch = parse_bind_execute("b", "broken");
    batch.push(FrontendMessage::Sync);
    batch.push(FrontendMessage::Sync);
    client.send(&batch).await;

    let first = client.until_ready().await;
    assert_eq!(first.len(), 4, "unexpected {:?}", first);
    assert!(matches!(first[2], BackendMessage::ErrorResponse(_)));
    assert_eq!(client.until_ready().await, vec![BackendMessage::ReadyForQuery(b'I')]);

    assert_next_cycle_is_clean(&mut client).await;
}

#[tokio::test]
async fn test_closing_statement_closes_portal() {
    let (mut client, _) = Client::login(trust_context()).await;
    client
        .send(&[
            FrontendMessage::Parse {
                name: "s".into(),
                query: "SELECT 42".into(),
                param_types: vec![],
            },
            FrontendMessage::Bind {
                portal: "p".into(),
                statement: "s".into(),
                param_formats: vec![],
                params: vec![],
                result_formats: vec![],
            },
            FrontendMessage::Close {
                target: Target::Statement,
                name: "s".into(),
            },
            FrontendMessage::Execute {
                portal: "p".into(),
                max_rows: 0,
            },
            FrontendMessage::Sync,
        ])
        .await;
    let messages = client.until_ready().await;
    assert_eq!(messages[0], BackendMessage::ParseComplete);
    assert_eq!(messages[1], BackendMessage::BindComplete);
    assert_eq!(messages[2], BackendMessage::CloseComplete);
    assert_eq!(error_code(&messages[3]), "34000");
    assert_eq!(messages[4], BackendMessage::ReadyForQuery(b'I'));
}

#[tokio::test]
async fn test_unknown_message_type() {
    let (mut client, _) = Client::login(trust_context()).await;
    client.send_raw(&[b'W', 0, 0, 0, 4]).await;
    client.send(&[FrontendMessage::Flush, FrontendMessage::Sync]).await;
    let messages = client.until_ready().await;
    assert_eq!(messages.len(), 2);
    match &messages[0] {
        BackendMessage::ErrorResponse(fields) => {
            assert_eq!(fields.code, "0A000");
            assert_eq!(fields.message, "Unsupported messageType: W");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_terminate_closes_connection() {
    let (mut client, _) = Client::login(trust_context()).await;
    client.send(&[FrontendMessage::Terminate]).await;
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn test_cancel_request_stops_running_query() {
    let context = context_with(&[rule(AuthMethodKind::Trust)], true);
    let (mut client, greeting) = Client::login(context.clone()).await;
    let (process_id, secret_key) = greeting
        .iter()
        .find_map(|m| match m {
            BackendMessage::BackendKeyData { process_id, secret_key } => Some((*process_id, *secret_key)),
            _ => None,
        })
        .expect("BackendKeyData");
    assert_eq!(greeting.len(), 9);

    client.send(&[FrontendMessage::Query("SELECT source FROM endless".into())]).await;
    assert!(matches!(client.recv().await, BackendMessage::RowDescription(_)));
    assert!(matches!(client.recv().await, BackendMessage::DataRow(_)));

    let mut canceller = Client::connect(context.clone());
    let mut buf = BytesMut::new();
    encode_cancel_request(process_id, secret_key, &mut buf);
    canceller.send_raw(&buf).await;
    assert!(canceller.is_closed().await);

    let messages = client.until_ready().await;
    let error = messages
        .iter()
        .find(|m| matches!(m, BackendMessage::ErrorResponse(_)))
        .expect("ErrorResponse");
    assert_eq!(error_code(error), "57014");

    client.send(&[FrontendMessage::Terminate]).await;
    assert!(client.is_closed().await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(context.cancel_registry.is_empty());
}
