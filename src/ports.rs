// OpenReLife Desktop - Port Reaper
// Terminates stale listeners on the backend port before each start

use netstat2::{get_sockets_info, AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, TcpState};
use std::time::Duration;
use tokio::net::TcpStream;
#[cfg(windows)]
use tokio::process::Command;

/// Upper bound for the whole reap, listing included
const REAP_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for a killed listener to release the port
const RELEASE_WAIT: Duration = Duration::from_secs(2);
const RELEASE_POLL: Duration = Duration::from_millis(100);

/// What `free_port` found and did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapOutcome {
    /// No foreign listener on the port
    Free,
    /// Listeners that were sent a kill signal
    Reaped(Vec<u32>),
    /// The socket table could not be read
    Unsupported,
    TimedOut,
}

/// Best-effort: kill whatever is listening on `port`. Never fails; the backend's
/// own bind is the final arbiter.
pub async fn free_port(port: u16) -> ReapOutcome {
    match tokio::time::timeout(REAP_TIMEOUT, reap(port)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            log::warn!("[Ports] Reaping port {} timed out after {:?}", port, REAP_TIMEOUT);
            ReapOutcome::TimedOut
        }
    }
}

async fn reap(port: u16) -> ReapOutcome {
    let Some(pids) = listening_pids(port).await else {
        log::warn!("[Ports] Socket table unavailable, skipping reap of port {}", port);
        return ReapOutcome::Unsupported;
    };

    let own_pid = std::process::id();
    let pids: Vec<u32> = pids.into_iter().filter(|pid| *pid != own_pid).collect();
    if pids.is_empty() {
        log::debug!("[Ports] Port {} is free", port);
        return ReapOutcome::Free;
    }

    for pid in &pids {
        log::info!("[Ports] Killing stale listener PID {} on port {}", pid, port);
        if let Err(e) = kill_pid(*pid).await {
            log::warn!("[Ports] Failed to kill PID {}: {}", pid, e);
        }
    }

    if !wait_for_release(port, RELEASE_WAIT).await {
        log::warn!("[Ports] Port {} still accepting connections after reap", port);
    }

    ReapOutcome::Reaped(pids)
}

/// PIDs with a TCP socket in LISTEN state on `port`, or `None` if the socket
/// table cannot be read
async fn listening_pids(port: u16) -> Option<Vec<u32>> {
    match tokio::task::spawn_blocking(move || scan_listeners(port)).await {
        Ok(pids) => pids,
        Err(e) => {
            log::warn!("[Ports] Socket scan task failed: {}", e);
            None
        }
    }
}

fn scan_listeners(port: u16) -> Option<Vec<u32>> {
    let af = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
    let sockets = match get_sockets_info(af, ProtocolFlags::TCP) {
        Ok(sockets) => sockets,
        Err(e) => {
            log::debug!("[Ports] Could not read socket table: {:?}", e);
            return None;
        }
    };

    let mut pids: Vec<u32> = sockets
        .into_iter()
        .filter(|info| match &info.protocol_socket_info {
            ProtocolSocketInfo::Tcp(tcp) => tcp.local_port == port && tcp.state == TcpState::Listen,
            ProtocolSocketInfo::Udp(_) => false,
        })
        .flat_map(|info| info.associated_pids)
        .filter(|pid| *pid != 0)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    Some(pids)
}

#[cfg(unix)]
async fn kill_pid(pid: u32) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)?;
    kill(Pid::from_raw(raw), Signal::SIGKILL)?;
    Ok(())
}

#[cfg(windows)]
async fn kill_pid(pid: u32) -> anyhow::Result<()> {
    let status = Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status()
        .await?;
    if !status.success() {
        anyhow::bail!("taskkill exited with {}", status);
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
async fn kill_pid(_pid: u32) -> anyhow::Result<()> {
    anyhow::bail!("process termination is not supported on this platform")
}

/// Wait until nothing accepts connections on the loopback port
async fn wait_for_release(port: u16, wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(RELEASE_POLL).await;
    }
}
