//! SOQL queries streamed page by page.
//!
//! The first page is requested when the consumer first pulls; each following
//! page is requested only after every record of the previous one has been
//! pulled. The SOQL text itself is never logged.

use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::RestSession;
use crate::error::StreamError;
use crate::record::{record_from_value, Record};
use crate::stream::RecordStream;

// ─────────────────────────────────────────────────────────────────────────────
// Wire types (match Salesforce JSON exactly)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireQueryResponse {
    total_size: u64,
    done: bool,
    next_records_url: Option<String>,
    records: Vec<serde_json::Value>,
}

/// Salesforce returns errors as an array of error objects.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSalesforceError {
    message: String,
    error_code: String,
}

enum Cursor {
    First(String),
    Next(String),
    Done,
}

struct QueryState {
    session: RestSession,
    cursor: Cursor,
    pages: u32,
    fetched: u64,
}

impl RestSession {
    /// Streams the records matching `soql`, following `nextRecordsUrl`.
    ///
    /// # Errors (on the stream)
    ///
    /// - `StreamError::NotAuthenticated` - Not logged in
    /// - `StreamError::SessionExpired` - Token rejected
    /// - `StreamError::SalesforceError` - Query syntax error or API error
    /// - `StreamError::ConnectionFailed` - Network error
    pub fn query_records(&self, soql: &str) -> RecordStream {
        let state = QueryState {
            session: self.clone(),
            cursor: Cursor::First(soql.to_string()),
            pages: 0,
            fetched: 0,
        };

        let pages = stream::try_unfold(state, |mut state| async move {
            let url = match std::mem::replace(&mut state.cursor, Cursor::Done) {
                Cursor::Done => return Ok(None),
                Cursor::First(soql) => {
                    info!("[SFDC] Starting SOQL query");
                    let path = format!("/services/data/{}/query", state.session.api_version());
                    let mut url = state.session.build_url(&path).await?;
                    url.query_pairs_mut().append_pair("q", &soql);
                    url
                }
                Cursor::Next(next) => state.session.build_url(&next).await?,
            };

            let page = fetch_page(&state.session, &url).await?;
            state.pages += 1;
            state.fetched += page.records.len() as u64;

            if state.pages == 1 {
                debug!("[SFDC] Query matched {} record(s)", page.total_size);
            }

            match (page.done, page.next_records_url) {
                (false, Some(next)) => state.cursor = Cursor::Next(next),
                _ => info!(
                    "[SFDC] Query complete: {} record(s), {} page(s)",
                    state.fetched, state.pages
                ),
            }

            let records = page
                .records
                .into_iter()
                .map(|value| {
                    record_from_value(value).ok_or_else(|| {
                        StreamError::Internal("Query returned a non-object record".to_string())
                    })
                })
                .collect::<Vec<Result<Record, StreamError>>>();

            Ok::<_, StreamError>(Some((stream::iter(records), state)))
        });

        RecordStream::new(pages.try_flatten().boxed())
    }
}

async fn fetch_page(session: &RestSession, url: &Url) -> Result<WireQueryResponse, StreamError> {
    let response = session.request_authed(Method::GET, url, None).await?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("Unable to read error body"));
        return Err(salesforce_error(status, &body));
    }

    response
        .json()
        .await
        .map_err(|e| StreamError::Internal(format!("Failed to parse query response: {}", e)))
}

fn salesforce_error(status: reqwest::StatusCode, body: &str) -> StreamError {
    if let Ok(errors) = serde_json::from_str::<Vec<WireSalesforceError>>(body) {
        if let Some(first) = errors.first() {
            return StreamError::SalesforceError(format!("[{}] {}", first.error_code, first.message));
        }
    }

    StreamError::SalesforceError(format!(
        "HTTP {} - {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown error")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionInfo, SessionSettings};
    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn logged_in(server: &MockServer) -> RestSession {
        let session = RestSession::new(SessionSettings::default()).unwrap();
        session
            .restore(SessionInfo {
                instance_url: server.uri(),
                access_token: SecretString::from("test_token".to_string()),
                identity_url: None,
            })
            .await;
        session
    }

    fn mock_records(count: usize, start_id: usize) -> Vec<serde_json::Value> {
        (start_id..start_id + count)
            .map(|i| {
                json!({
                    "attributes": { "type": "Account", "url": format!("/services/data/v60.0/sobjects/Account/{}", i) },
                    "Id": format!("001xx00000{:05}", i),
                    "Name": format!("Account {}", i)
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn pagination_streams_all_pages_in_order() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/query"))
            .and(query_param("q", "SELECT Id, Name FROM Account"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalSize": 6,
                "done": false,
                "nextRecordsUrl": "/services/data/v60.0/query/01gxx000000001-3",
                "records": mock_records(3, 1)
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/query/01gxx000000001-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalSize": 6,
                "done": true,
                "records": mock_records(3, 4)
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = logged_in(&server).await;
        let records = session
            .query("SELECT Id, Name FROM Account")
            .collect_records()
            .await
            .unwrap();

        let names: Vec<&str> = records.iter().filter_map(|r| r["Name"].as_str()).collect();
        assert_eq!(
            names,
            vec!["Account 1", "Account 2", "Account 3", "Account 4", "Account 5", "Account 6"]
        );
    }

    #[tokio::test]
    async fn next_page_is_fetched_only_when_pulled() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalSize": 4,
                "done": false,
                "nextRecordsUrl": "/services/data/v60.0/query/01gxx000000002-2",
                "records": mock_records(2, 1)
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/query/01gxx000000002-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalSize": 4,
                "done": true,
                "records": mock_records(2, 3)
            })))
            .expect(0)
            .mount(&server)
            .await;

        let session = logged_in(&server).await;
        let mut stream = session.query("SELECT Id FROM Account");
        stream.next_record().await.unwrap().unwrap();
        stream.next_record().await.unwrap().unwrap();
        drop(stream);
    }

    #[tokio::test]
    async fn salesforce_error_is_parsed() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/query"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!([{
                "message": "unexpected token: FORM",
                "errorCode": "MALFORMED_QUERY"
            }])))
            .mount(&server)
            .await;

        let session = logged_in(&server).await;
        let err = session
            .query("SELECT Id FORM Account")
            .collect_records()
            .await
            .unwrap_err();

        match err {
            StreamError::SalesforceError(msg) => {
                assert!(msg.contains("MALFORMED_QUERY"));
                assert!(msg.contains("unexpected token"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn generic_http_error_names_status() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/query"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;

        let session = logged_in(&server).await;
        let err = session.query("SELECT Id FROM Account").collect_records().await.unwrap_err();
        assert!(matches!(&err, StreamError::SalesforceError(msg) if msg.contains("HTTP 500")));
    }

    #[tokio::test]
    async fn expired_session_ends_stream_with_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/query"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let session = logged_in(&server).await;
        let mut stream = session.query("SELECT Id FROM Account");
        assert!(matches!(stream.next_record().await, Some(Err(StreamError::SessionExpired))));
        assert!(stream.next_record().await.is_none());
    }

    #[tokio::test]
    async fn empty_result_ends_immediately() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalSize": 0,
                "done": true,
                "records": []
            })))
            .mount(&server)
            .await;

        let session = logged_in(&server).await;
        let records = session.query("SELECT Id FROM Account WHERE Name = 'none'")
            .collect_records()
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn query_without_login_fails_on_first_pull() {
        let session = RestSession::new(SessionSettings::default()).unwrap();
        let mut stream = session.query("SELECT Id FROM Account");
        assert!(matches!(stream.next_record().await, Some(Err(StreamError::NotAuthenticated))));
    }
}
