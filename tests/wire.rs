use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use caresched::config::SchedulingConfig;
use caresched::practice::PracticeManager;
use caresched::wire;

const PASSWORD: &str = "caresched";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("caresched_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let practices = Arc::new(PracticeManager::new(dir, 1000, SchedulingConfig::default()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let practices = practices.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, practices, PASSWORD.to_string(), None)
                    .await;
            });
        }
    });

    addr
}

async fn try_connect(
    addr: SocketAddr,
    practice: &str,
    user: &str,
) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(practice)
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, practice: &str, user: &str) -> Client {
    try_connect(addr, practice, user).await.unwrap()
}

async fn clinician(addr: SocketAddr, practice: &str) -> (Client, Ulid) {
    let id = Ulid::new();
    (connect(addr, practice, &id.to_string()).await, id)
}

/// A week out, so lead time and past-date rules never interfere.
fn visit_day() -> NaiveDate {
    chrono::Local::now().date_naive() + Days::new(7)
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn register_patient(client: &Client) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO patients (id, active) VALUES ('{id}', true)"))
        .await
        .unwrap();
    id
}

async fn book(
    client: &Client,
    patient: Ulid,
    date: NaiveDate,
    start: &str,
    duration: u32,
) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO appointments (id, patient_id, date, start_time, duration, kind) \
             VALUES ('{id}', '{patient}', '{date}', '{start}', {duration}, 'follow_up')"
        ))
        .await?;
    Ok(id)
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_and_read_back() {
    let addr = start_test_server().await;
    let (client, me) = clinician(addr, "north").await;
    let patient = register_patient(&client).await;
    let date = visit_day();

    let id = book(&client, patient, date, "10:00", 45).await.unwrap();

    let found = rows(
        client
            .simple_query(&format!("SELECT * FROM appointments WHERE id = '{id}'"))
            .await
            .unwrap(),
    );
    assert_eq!(found.len(), 1);
    let row = &found[0];
    assert_eq!(row.get("id"), Some(id.to_string().as_str()));
    assert_eq!(row.get("patient_id"), Some(patient.to_string().as_str()));
    assert_eq!(row.get("clinician_id"), Some(me.to_string().as_str()));
    assert_eq!(row.get("date"), Some(date.to_string().as_str()));
    assert_eq!(row.get("start_time"), Some("10:00"));
    assert_eq!(row.get("end_time"), Some("10:45"));
    assert_eq!(row.get("duration"), Some("45"));
    assert_eq!(row.get("status"), Some("scheduled"));
    assert_eq!(row.get("kind"), Some("follow_up"));
    assert_eq!(row.get("notes"), None);
    assert_eq!(row.get("version"), Some("1"));
}

#[tokio::test]
async fn overlapping_booking_reports_clinician_conflict() {
    let addr = start_test_server().await;
    let (client, _) = clinician(addr, "north").await;
    let first_patient = register_patient(&client).await;
    let second_patient = register_patient(&client).await;
    let date = visit_day();

    let first = book(&client, first_patient, date, "10:00", 60).await.unwrap();
    let err = book(&client, second_patient, date, "10:30", 30).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("SC021"));
    let message = err.as_db_error().unwrap().message().to_string();
    assert!(message.starts_with("clinician_conflict: "), "{message}");
    assert!(message.contains(&first.to_string()));

    // Boundary touch is fine.
    book(&client, second_patient, date, "11:00", 30).await.unwrap();
}

#[tokio::test]
async fn validation_errors_have_stable_codes() {
    let addr = start_test_server().await;
    let (client, _) = clinician(addr, "north").await;
    let patient = register_patient(&client).await;
    let date = visit_day();

    let err = book(&client, patient, date, "10:00", 5).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("SC001"));

    let err = book(&client, patient, date, "19:30", 60).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("SC002"));

    let err = book(&client, Ulid::new(), date, "10:00", 30).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("SC010"));
}

#[tokio::test]
async fn availability_over_extended_protocol() {
    let addr = start_test_server().await;
    let (client, me) = clinician(addr, "north").await;
    let patient = register_patient(&client).await;
    let date = visit_day();
    book(&client, patient, date, "08:30", 60).await.unwrap();

    let found = client
        .query(
            "SELECT * FROM availability WHERE clinician_id = $1 AND date = $2 AND duration = $3",
            &[&me.to_string(), &date.to_string(), &"60"],
        )
        .await
        .unwrap();
    let starts: Vec<String> = found.iter().map(|r| r.get("start_time")).collect();
    // 08:00 and 09:00 overlap the booking, 09:30 is the first free start.
    assert_eq!(starts.first().map(String::as_str), Some("09:30"));
    assert_eq!(starts.last().map(String::as_str), Some("19:00"));
    assert!(!starts.iter().any(|s| s == "08:00" || s == "09:00"));
    let last_end: String = found.last().unwrap().get("end_time");
    assert_eq!(last_end, "20:00");
}

#[tokio::test]
async fn conflicts_preflight() {
    let addr = start_test_server().await;
    let (client, me) = clinician(addr, "north").await;
    let patient = register_patient(&client).await;
    let date = visit_day();
    book(&client, patient, date, "14:00", 30).await.unwrap();

    let check = |scope: &str, id: Ulid, start: &str, end: &str| {
        format!(
            "SELECT * FROM conflicts WHERE scope = '{scope}' AND scope_id = '{id}' \
             AND date = '{date}' AND start_time = '{start}' AND end_time = '{end}'"
        )
    };

    let busy = rows(client.simple_query(&check("clinician", me, "14:15", "14:45")).await.unwrap());
    assert!(matches!(busy[0].get("has_conflict"), Some("t") | Some("true")));

    let free = rows(client.simple_query(&check("patient", patient, "14:30", "15:00")).await.unwrap());
    assert!(matches!(free[0].get("has_conflict"), Some("f") | Some("false")));
}

#[tokio::test]
async fn lifecycle_and_reschedule_through_sql() {
    let addr = start_test_server().await;
    let (client, me) = clinician(addr, "north").await;
    let patient = register_patient(&client).await;
    let date = visit_day();
    let id = book(&client, patient, date, "10:00", 30).await.unwrap();

    client
        .batch_execute(&format!(
            "INSERT INTO reschedules (appointment_id, start_time) VALUES ('{id}', '11:00')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO status_changes (appointment_id, status) VALUES ('{id}', 'cancelled')"
        ))
        .await
        .unwrap();

    let listed = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM appointments WHERE clinician_id = '{me}' AND date = '{date}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("start_time"), Some("11:00"));
    assert_eq!(listed[0].get("status"), Some("cancelled"));
    assert_eq!(listed[0].get("version"), Some("3"));

    let err = client
        .batch_execute(&format!(
            "INSERT INTO status_changes (appointment_id, status) VALUES ('{id}', 'confirmed')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("SC030"));

    client
        .batch_execute(&format!("DELETE FROM appointments WHERE id = '{id}'"))
        .await
        .unwrap();
    let gone = rows(
        client
            .simple_query(&format!("SELECT * FROM appointments WHERE id = '{id}'"))
            .await
            .unwrap(),
    );
    assert!(gone.is_empty());
}

#[tokio::test]
async fn other_clinician_is_forbidden() {
    let addr = start_test_server().await;
    let (owner, _) = clinician(addr, "north").await;
    let (intruder, _) = clinician(addr, "north").await;
    let patient = register_patient(&owner).await;
    let id = book(&owner, patient, visit_day(), "10:00", 30).await.unwrap();

    let err = intruder
        .batch_execute(&format!("DELETE FROM appointments WHERE id = '{id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));
}

#[tokio::test]
async fn practices_are_isolated() {
    let addr = start_test_server().await;
    let (north, _) = clinician(addr, "north").await;
    let (south, _) = clinician(addr, "south").await;
    let patient = register_patient(&north).await;

    let err = book(&south, patient, visit_day(), "10:00", 30).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("SC010"));
}

#[tokio::test]
async fn user_name_must_be_a_clinician_id() {
    let addr = start_test_server().await;
    let err = try_connect(addr, "north", "admin").await.err().unwrap();
    assert_eq!(sqlstate(&err), Some("28000"));

    // A clinician id gets in with the same password.
    let (client, _) = clinician(addr, "north").await;
    client
        .simple_query("SELECT * FROM appointments WHERE id = '01J0000000000000000000000A'")
        .await
        .unwrap();
}

#[tokio::test]
async fn malformed_statement_is_a_syntax_error() {
    let addr = start_test_server().await;
    let (client, _) = clinician(addr, "north").await;
    let err = client.batch_execute("SELEC nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let err = client
        .batch_execute("UPDATE appointments SET notes = 'x'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}
