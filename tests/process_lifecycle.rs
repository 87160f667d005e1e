//! Process lifecycle tests
//!
//! Children spawned for `arkdep` or `mount` must sit in their own process
//! group so the whole tree can be torn down if the deployment is aborted.

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use arkdeploy::process_guard::{ChildRegistry, CommandProcessGroup};
use nix::sys::signal;
use nix::unistd::{getpgid, Pid};

/// Helper: alive means signalable and not a zombie
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| !matches!(state, "Z" | "X")),
        Err(_) => false,
    }
}

fn wait_for_process_death(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_child_leads_its_own_process_group() {
    let mut child = Command::new("sleep")
        .arg("1000")
        .stdout(Stdio::null())
        .in_new_process_group()
        .spawn()
        .expect("Failed to spawn sleep");

    let pid = Pid::from_raw(child.id() as i32);
    let pgid = getpgid(Some(pid)).expect("Failed to read process group");
    assert_eq!(pgid, pid, "child should lead its own process group");

    child.kill().ok();
    child.wait().ok();
}

#[test]
fn test_registry_terminates_whole_group() {
    // The shell forks a grandchild that shares its process group
    let mut child = Command::new("sh")
        .args(["-c", "sleep 1000 & echo $!; wait"])
        .stdout(Stdio::piped())
        .in_new_process_group()
        .spawn()
        .expect("Failed to spawn shell");

    let mut line = String::new();
    {
        use std::io::BufRead;
        let stdout = child.stdout.take().expect("stdout is piped");
        std::io::BufReader::new(stdout)
            .read_line(&mut line)
            .expect("Failed to read grandchild PID");
    }
    let grandchild: u32 = line.trim().parse().expect("PID should be numeric");
    assert!(is_process_alive(grandchild));

    let mut registry = ChildRegistry::default();
    registry.register(child.id());
    assert_eq!(registry.count(), 1);
    registry.terminate_all(Duration::from_secs(2));
    assert_eq!(registry.count(), 0);

    child.wait().ok();
    assert!(
        wait_for_process_death(grandchild, Duration::from_secs(5)),
        "grandchild {} survived group termination",
        grandchild
    );
}
