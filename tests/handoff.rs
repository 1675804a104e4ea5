//! End-to-end handoff over a real fork/exec: this binary upgrades into a
//! fresh copy of itself, passing two pipes along. The child writes its pid
//! and its view of `has_parent` back through them, declares itself ready,
//! and exits; the parent checks everything lined up.

use std::io::{Read, Write};
use std::process;
use std::time::Duration;

fn main() {
    env_logger::init();

    let upgrader = moult::Upgrader::new(moult::Options {
        upgrade_timeout: Duration::from_secs(30),
        pid_file: None,
    })
    .expect("can't create upgrader");

    if upgrader.has_parent() {
        run_child(&upgrader);
    } else {
        run_parent(&upgrader);
    }
}

/// The successor: report back through the inherited pipes, then become
/// ready and exit.
fn run_child(upgrader: &moult::Upgrader) {
    let mut pid_w = upgrader
        .fds()
        .file("pid")
        .expect("can't look up pid pipe")
        .expect("pid pipe was not inherited");
    write!(pid_w, "{}", process::id()).expect("can't report pid");
    drop(pid_w);

    let mut flag_w = upgrader
        .fds()
        .file("has-parent")
        .expect("can't look up flag pipe")
        .expect("flag pipe was not inherited");
    write!(flag_w, "{}", upgrader.has_parent()).expect("can't report parentage");
    drop(flag_w);

    upgrader.ready().expect("child can't become ready");
}

fn run_parent(upgrader: &moult::Upgrader) {
    let (mut pid_r, pid_w) = os_pipe::pipe().expect("can't create pid pipe");
    upgrader
        .fds()
        .add_file("pid", &pid_w)
        .expect("can't register pid pipe");
    drop(pid_w);

    let (mut flag_r, flag_w) = os_pipe::pipe().expect("can't create flag pipe");
    upgrader
        .fds()
        .add_file("has-parent", &flag_w)
        .expect("can't register flag pipe");
    drop(flag_w);

    upgrader.ready().expect("parent can't become ready");

    // Ready propagates to the coordinator asynchronously.
    loop {
        match upgrader.upgrade() {
            Ok(()) => break,
            Err(moult::UpgradeError::NotReady) => std::thread::yield_now(),
            Err(err) => panic!("upgrade failed: {err}"),
        }
    }

    // The handoff closed our copies of the write ends, so these reads
    // terminate once the child exits.
    let mut pid = String::new();
    pid_r.read_to_string(&mut pid).expect("can't read child pid");
    let pid: u32 = pid.parse().expect("child sent a malformed pid");
    assert_ne!(pid, process::id(), "child must be a new process");

    let mut flag = String::new();
    flag_r
        .read_to_string(&mut flag)
        .expect("can't read child flag");
    assert_eq!(flag, "true", "child did not recognize its parent");

    upgrader.stop();
    let _ = upgrader.exit().recv();

    println!("handoff ok: child pid {pid}");
}
