// OpenReLife Desktop - Operator Notices
// Blocking dialogs and reminders raised by the supervisor and the recording client

use std::path::PathBuf;
use tauri::{AppHandle, Runtime};
use tauri_plugin_dialog::{DialogExt, MessageDialogButtons, MessageDialogKind};
use tauri_plugin_notification::NotificationExt;

/// Context shown when the backend exits abnormally
#[derive(Clone, Debug)]
pub struct CrashReport {
    /// `None` when the process was ended by a signal
    pub exit_code: Option<i32>,
    pub tail: Vec<String>,
    pub log_path: PathBuf,
}

impl CrashReport {
    pub fn summary(&self) -> String {
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        format!(
            "The OpenReLife backend stopped unexpectedly (exit: {}).\n\nLast log lines:\n{}",
            code,
            self.tail.join("\n")
        )
    }
}

/// Everything the core reports to the operator. Implementations must not block the caller.
pub trait Notifier: Send + Sync {
    fn backend_crashed(&self, report: CrashReport);
    fn spawn_failed(&self, message: String);
    fn backend_unreachable(&self, attempts: u32);
    fn recording_reminder(&self);
}

/// Notices backed by the dialog, notification and shell plugins
pub struct TauriNotifier<R: Runtime> {
    app: AppHandle<R>,
}

impl<R: Runtime> TauriNotifier<R> {
    pub fn new(app: AppHandle<R>) -> Self {
        Self { app }
    }
}

impl<R: Runtime> Notifier for TauriNotifier<R> {
    fn backend_crashed(&self, report: CrashReport) {
        let app = self.app.clone();
        // blocking_show must stay off the main thread and the async workers
        tauri::async_runtime::spawn_blocking(move || {
            let open_logs = app
                .dialog()
                .message(report.summary())
                .title("OpenReLife Backend Error")
                .kind(MessageDialogKind::Error)
                .buttons(MessageDialogButtons::OkCancelCustom(
                    "Open Logs".to_string(),
                    "Dismiss".to_string(),
                ))
                .blocking_show();

            if open_logs {
                open_path(&app, &report.log_path);
            }
        });
    }

    fn spawn_failed(&self, message: String) {
        let app = self.app.clone();
        tauri::async_runtime::spawn_blocking(move || {
            app.dialog()
                .message(message)
                .title("OpenReLife Could Not Start")
                .kind(MessageDialogKind::Error)
                .buttons(MessageDialogButtons::Ok)
                .blocking_show();
        });
    }

    fn backend_unreachable(&self, attempts: u32) {
        let app = self.app.clone();
        tauri::async_runtime::spawn_blocking(move || {
            app.dialog()
                .message(format!(
                    "The OpenReLife backend did not respond after {} attempts.",
                    attempts
                ))
                .title("OpenReLife Not Responding")
                .kind(MessageDialogKind::Warning)
                .buttons(MessageDialogButtons::Ok)
                .blocking_show();
        });
    }

    fn recording_reminder(&self) {
        if let Err(e) = self
            .app
            .notification()
            .builder()
            .title("OpenReLife")
            .body("Recording is still paused.")
            .show()
        {
            log::warn!("[Recording] Failed to show reminder: {}", e);
        }
    }
}

#[allow(deprecated)]
fn open_path<R: Runtime>(app: &AppHandle<R>, path: &std::path::Path) {
    use tauri_plugin_shell::ShellExt;

    if let Err(e) = app.shell().open(path.to_string_lossy().to_string(), None) {
        log::warn!("[Shell] Failed to open {}: {}", path.display(), e);
    }
}
