use crate::coordinator::{Allocation, Coordinator, TaskRange};
use crate::crash::{CrashRecord, CrashSubmission};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const STATUS_OK: &str = "OK";
const STATUS_STOPPED: &str = "Target is stopped";

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Coordinator answered with HTTP {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Deserialize, Debug)]
struct TaskResponse {
    status: String,
    #[serde(default)]
    task: Option<TaskRange>,
}

/// Maps a `/api/task/next` body to an allocation. Anything unexpected means no task.
pub fn parse_task_response(body: &str) -> Allocation {
    let response: TaskResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Malformed task response");
            return Allocation::NoneAvailable;
        }
    };
    match (response.status.as_str(), response.task) {
        (STATUS_OK, Some(task)) => Allocation::Granted(task),
        (STATUS_STOPPED, _) => Allocation::Paused,
        (status, _) => {
            debug!(status, "No task available");
            Allocation::NoneAvailable
        }
    }
}

/// Coordinator reached over HTTP.
#[derive(Debug, Clone)]
pub struct RemoteCoordinator {
    base: String,
    client: Client,
}

impl RemoteCoordinator {
    pub fn new(uri: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(timeout).build()?;
        info!(uri, "Using remote coordinator");
        Ok(Self {
            base: uri.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn fetch_task(&self) -> Result<String, RemoteError> {
        let response = self.client.get(format!("{}/api/task/next", self.base)).send()?;
        if !response.status().is_success() {
            return Err(RemoteError::Status(response.status()));
        }
        Ok(response.text()?)
    }

    fn post_completion(&self, index: u64) -> Result<(), RemoteError> {
        self.client
            .post(format!("{}/api/task/{index}/completed", self.base))
            .send()?
            .error_for_status()?;
        Ok(())
    }

    fn post_crash(&self, submission: &CrashSubmission) -> Result<(), RemoteError> {
        self.client
            .post(format!("{}/api/crash/submit", self.base))
            .json(submission)
            .send()?
            .error_for_status()?;
        Ok(())
    }
}

impl Coordinator for RemoteCoordinator {
    fn allocate_range(&self) -> Allocation {
        match self.fetch_task() {
            Ok(body) => parse_task_response(&body),
            Err(e) => {
                warn!(error = %e, "Coordinator unavailable");
                Allocation::NoneAvailable
            }
        }
    }

    fn report_completion(&self, index: u64) {
        if let Err(e) = self.post_completion(index) {
            warn!(index, error = %e, "Failed to report completion");
        }
    }

    fn submit_crash(&self, record: &CrashRecord) {
        if let Err(e) = self.post_crash(&CrashSubmission::from(record)) {
            warn!(index = record.index, error = %e, "Failed to submit crash");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{CrashReason, CrashReport};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if data.len() >= header_end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    /// Serves one canned JSON response and returns the raw request it received.
    fn serve_once(body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            let response = format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            request
        });
        (uri, handle)
    }

    #[test]
    fn task_responses_map_to_allocations() {
        assert_eq!(
            parse_task_response(
                r#"{"status": "OK", "task": {"start": 5, "end": 6, "iterations": 100}}"#
            ),
            Allocation::Granted(TaskRange {
                start: 5,
                end: 6,
                iterations: 100
            })
        );
        assert_eq!(
            parse_task_response(r#"{"status": "Target is stopped", "task": null}"#),
            Allocation::Paused
        );
        assert_eq!(
            parse_task_response(r#"{"status": "No more tasks", "task": null}"#),
            Allocation::NoneAvailable
        );
        assert_eq!(parse_task_response(r#"{"status": "OK"}"#), Allocation::NoneAvailable);
        assert_eq!(parse_task_response("<html>"), Allocation::NoneAvailable);
    }

    #[test]
    fn unreachable_coordinator_means_no_task() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let coordinator = RemoteCoordinator::new(&uri, Duration::from_secs(2)).unwrap();
        assert_eq!(coordinator.allocate_range(), Allocation::NoneAvailable);
        coordinator.report_completion(3);
    }

    #[test]
    fn next_task_is_fetched_over_http() {
        let (uri, handle) =
            serve_once(r#"{"status":"OK","task":{"start":10,"end":11,"iterations":100}}"#);
        let coordinator =
            RemoteCoordinator::new(&format!("{uri}/"), Duration::from_secs(5)).unwrap();
        assert_eq!(
            coordinator.allocate_range(),
            Allocation::Granted(TaskRange {
                start: 10,
                end: 11,
                iterations: 100
            })
        );
        assert!(handle.join().unwrap().starts_with("GET /api/task/next "));
    }

    #[test]
    fn crash_submission_posts_json_body() {
        let (uri, handle) = serve_once("{}");
        let coordinator = RemoteCoordinator::new(&uri, Duration::from_secs(5)).unwrap();
        let record = CrashRecord::new(
            7,
            CrashReport {
                signal: "SIGFPE".to_string(),
                reason: CrashReason::DivisionByZero,
                instruction_pointer: 0x8049abc,
                fault_address: Some(0x8049abc),
                module_offset: Some(0xabc),
                module_path: Some("/srv/hlds_linux".to_string()),
                log: "Signal: SIGFPE (8)\n".to_string(),
            },
            vec![vec![0x01]],
        );
        coordinator.submit_crash(&record);

        let request = handle.join().unwrap();
        assert!(request.starts_with("POST /api/crash/submit "));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["index"], 7);
        assert_eq!(json["reason"], "DivisionByZero");
        assert_eq!(json["instruction"], "0x8049abc");
        assert_eq!(json["testcase"][0], "AQ==");
    }
}
