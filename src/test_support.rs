// Shared fixtures for unit tests

use crate::notice::{CrashReport, Notifier};
use std::net::SocketAddr;
use std::sync::Mutex;

/// Serve `router` on an ephemeral loopback port and return its base URL
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A loopback address with nothing listening on it
pub fn refused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Records every notice for assertions
#[derive(Default)]
pub struct RecordingNotifier {
    pub crashes: Mutex<Vec<CrashReport>>,
    pub spawn_failures: Mutex<Vec<String>>,
    pub unreachable: Mutex<Vec<u32>>,
    pub reminders: Mutex<u32>,
}

impl RecordingNotifier {
    pub fn crash_count(&self) -> usize {
        self.crashes.lock().unwrap().len()
    }

    pub fn reminder_count(&self) -> u32 {
        *self.reminders.lock().unwrap()
    }
}

impl Notifier for RecordingNotifier {
    fn backend_crashed(&self, report: CrashReport) {
        self.crashes.lock().unwrap().push(report);
    }

    fn spawn_failed(&self, message: String) {
        self.spawn_failures.lock().unwrap().push(message);
    }

    fn backend_unreachable(&self, attempts: u32) {
        self.unreachable.lock().unwrap().push(attempts);
    }

    fn recording_reminder(&self) {
        *self.reminders.lock().unwrap() += 1;
    }
}
