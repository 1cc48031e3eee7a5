// OpenReLife Desktop - Tauri v2
// Main entry point: wires the backend supervisor and recording client into the shell

#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod config;
mod error;
mod logsink;
mod notice;
mod ports;
mod readiness;
mod recording;
mod service;
#[cfg(test)]
mod test_support;

use config::{settings, ServiceConfig};
use notice::{Notifier, TauriNotifier};
use readiness::{wait_until_ready, Readiness, RetryPolicy, STATUS_CHECK_ATTEMPTS};
use recording::{RecordingClient, RecordingStatus};
use service::{BackendSupervisor, ProcessState};
use std::sync::Arc;
use tauri::{AppHandle, Emitter, Manager, RunEvent, State};
use tauri_plugin_log::{Target, TargetKind};

/// Everything the shell needs to drive the backend; created once in setup
struct Backend {
    config: ServiceConfig,
    supervisor: Arc<BackendSupervisor>,
    recording: Arc<RecordingClient>,
    notifier: Arc<dyn Notifier>,
    /// Shared client for readiness probes
    probe: reqwest::Client,
}

/// Tauri command to get the backend process state
#[tauri::command]
async fn get_backend_status(backend: State<'_, Arc<Backend>>) -> Result<Option<ProcessState>, String> {
    Ok(backend.supervisor.state().await)
}

/// Tauri command to get the port the backend binds
#[tauri::command]
fn get_backend_port(backend: State<'_, Arc<Backend>>) -> u16 {
    backend.config.port
}

/// Tauri command to get the backend log path
#[tauri::command]
fn get_log_path(backend: State<'_, Arc<Backend>>) -> String {
    backend.config.log_path.to_string_lossy().to_string()
}

/// Tauri command to restart the backend; readiness is reported through events
#[tauri::command]
async fn restart_backend(app: AppHandle, backend: State<'_, Arc<Backend>>) -> Result<(), String> {
    let backend = backend.inner().clone();
    tauri::async_runtime::spawn(start_and_wait(app, backend));
    Ok(())
}

/// Tauri command to stop the backend
#[tauri::command]
async fn stop_backend(backend: State<'_, Arc<Backend>>) -> Result<bool, String> {
    Ok(backend.supervisor.stop().await)
}

/// Tauri command to check the backend answers within the status-check budget
#[tauri::command]
async fn check_backend(backend: State<'_, Arc<Backend>>) -> Result<bool, String> {
    let token = backend.supervisor.lifecycle_token().await;
    let policy = RetryPolicy::bounded(STATUS_CHECK_ATTEMPTS);

    match wait_until_ready(&backend.probe, &backend.config.base_url(), policy, &token).await {
        Readiness::Ready { .. } => Ok(true),
        Readiness::TimedOut { attempts } => {
            backend.notifier.backend_unreachable(attempts);
            if let Some(process) = backend.supervisor.current().await {
                backend
                    .supervisor
                    .mark_failed(process.generation, "Backend not responding".to_string())
                    .await;
            }
            Ok(false)
        }
        Readiness::Cancelled => Ok(false),
    }
}

// ============================================================================
// Recording Commands
// ============================================================================

/// Tauri command to read the mirrored recording status (no request)
#[tauri::command]
async fn get_recording_status(backend: State<'_, Arc<Backend>>) -> Result<RecordingStatus, String> {
    Ok(backend.recording.status().await)
}

/// Tauri command to re-sync the recording status from the backend
#[tauri::command]
async fn check_recording_status(
    app: AppHandle,
    backend: State<'_, Arc<Backend>>,
) -> Result<RecordingStatus, String> {
    if let Some(update) = backend.recording.check_status().await {
        app.emit("recording-status-changed", update.status).ok();
    }
    Ok(backend.recording.status().await)
}

/// Tauri command to pause or resume recording
#[tauri::command]
async fn toggle_recording(
    app: AppHandle,
    backend: State<'_, Arc<Backend>>,
) -> Result<RecordingStatus, String> {
    let update = backend.recording.toggle().await.map_err(|e| e.to_string())?;
    app.emit("recording-status-changed", update.status).ok();
    Ok(update.status)
}

/// Start the backend and wait, without limit, for it to answer
async fn start_and_wait(app: AppHandle, backend: Arc<Backend>) {
    let process = match backend.supervisor.start(&backend.config).await {
        Ok(process) => process,
        Err(e) => {
            log::error!("[Shell] Failed to start backend: {}", e);
            app.emit("backend-error", e.to_string()).ok();
            return;
        }
    };

    let url = backend.config.base_url();
    let token = backend.supervisor.lifecycle_token().await;

    match wait_until_ready(&backend.probe, &url, RetryPolicy::unbounded(), &token).await {
        Readiness::Ready { .. } => {
            // A stop or restart after the probe left makes this result stale
            if !backend.supervisor.mark_running(process.generation).await {
                log::debug!("[Shell] Ignoring readiness of a replaced backend");
                return;
            }
            log::info!("[Shell] Backend is ready!");
            show_content(&app, &url);
            app.emit("backend-ready", ()).ok();

            if let Some(update) = backend.recording.check_status().await {
                app.emit("recording-status-changed", update.status).ok();
            }
        }
        Readiness::TimedOut { attempts } => {
            log::error!("[Shell] Backend not ready after {} attempts", attempts);
            app.emit("backend-error", "Backend not responding").ok();
        }
        Readiness::Cancelled => {
            log::debug!("[Shell] Readiness wait cancelled");
        }
    }
}

/// Swap the splash for the backend UI
fn show_content(app: &AppHandle, url: &str) {
    let Some(window) = app.get_webview_window("main") else {
        return;
    };
    match url.parse::<tauri::Url>() {
        Ok(url) => {
            if let Err(e) = window.navigate(url) {
                log::warn!("[Shell] Failed to load backend UI: {}", e);
            }
        }
        Err(e) => log::warn!("[Shell] Invalid backend URL {}: {}", url, e),
    }
}

/// Resolve configuration and build the supervisor and recording client
fn init_backend(app: &AppHandle) -> anyhow::Result<Arc<Backend>> {
    let data_dir = app
        .path()
        .app_data_dir()
        .map_err(|e| anyhow::anyhow!("Failed to get app data dir: {}", e))?;
    std::fs::create_dir_all(&data_dir)?;

    let resource_dir = app
        .path()
        .resource_dir()
        .map_err(|e| anyhow::anyhow!("Failed to get resource dir: {}", e))?;

    let port = settings::resolve_port(&data_dir);
    let config = ServiceConfig::for_installation(port, config::backend_root(&resource_dir), &data_dir);
    log::info!("[Shell] Data dir: {:?}", data_dir);
    log::info!("[Shell] Backend URL: {}", config.base_url());

    let notifier: Arc<dyn Notifier> = Arc::new(TauriNotifier::new(app.clone()));
    let supervisor = Arc::new(BackendSupervisor::new(notifier.clone()));
    let recording = Arc::new(RecordingClient::new(config.base_url(), notifier.clone())?);
    let probe = readiness::probe_client()?;

    Ok(Arc::new(Backend {
        config,
        supervisor,
        recording,
        notifier,
        probe,
    }))
}

fn main() {
    tauri::Builder::default()
        .plugin(
            tauri_plugin_log::Builder::new()
                .targets([
                    Target::new(TargetKind::Stdout),
                    Target::new(TargetKind::LogDir {
                        file_name: Some("openrelife-desktop".to_string()),
                    }),
                    Target::new(TargetKind::Webview),
                ])
                .level(log::LevelFilter::Info)
                .build(),
        )
        .plugin(tauri_plugin_shell::init())
        .plugin(tauri_plugin_dialog::init())
        .plugin(tauri_plugin_notification::init())
        .setup(|app| {
            let backend = init_backend(app.handle())?;
            app.manage(backend.clone());

            let startup_handle = app.handle().clone();
            tauri::async_runtime::spawn(start_and_wait(startup_handle, backend));

            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            get_backend_status,
            get_backend_port,
            get_log_path,
            restart_backend,
            stop_backend,
            check_backend,
            // Recording commands
            get_recording_status,
            check_recording_status,
            toggle_recording,
        ])
        .build(tauri::generate_context!())
        .expect("error while building tauri application")
        .run(|app, event| {
            if let RunEvent::Exit = event {
                log::info!("[Shell] Exiting, shutting down backend...");
                let Some(backend) = app.try_state::<Arc<Backend>>() else {
                    return;
                };
                let backend = backend.inner().clone();

                // Stop synchronously so the backend never outlives the shell
                tauri::async_runtime::block_on(async {
                    backend.recording.shutdown().await;
                    backend.supervisor.stop().await;
                });
            }
        });
}
