//! fakes shared by the manager and supervisor tests

use std::{
    io,
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use super::{
    manager::{KillTimeouts, TunnelManager},
    ports::{MockPortProbe, PortProbe},
    process::{ProcessLauncher, TunnelProcess},
    tunnel::{TunnelError, TunnelSpec},
};

pub(crate) fn exit_status(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code << 8)
}

pub(crate) fn free_ports() -> MockPortProbe {
    let mut probe = MockPortProbe::new();
    probe.expect_is_port_in_use().returning(|_| false);
    probe
}

pub(crate) fn taken_ports(ports: &[u16]) -> MockPortProbe {
    let taken = ports.to_vec();
    let mut probe = MockPortProbe::new();
    probe
        .expect_is_port_in_use()
        .returning(move |port| taken.contains(&port));
    probe
}

pub(crate) fn manager_with(probe: impl PortProbe + 'static) -> (TunnelManager, FakeLauncher) {
    let launcher = FakeLauncher::default();
    let manager = TunnelManager::new(Box::new(launcher.clone()), Box::new(probe)).with_timeouts(
        KillTimeouts {
            graceful: Duration::from_millis(50),
            forced: Duration::from_millis(50),
        },
    );
    (manager, launcher)
}

#[derive(Default)]
struct ProcessState {
    exit: Option<i32>,
    terminated: bool,
    stderr_read: bool,
}

/// remote control for a process handed out by `FakeLauncher`
#[derive(Clone, Default)]
pub(crate) struct FakeHandle(Arc<Mutex<ProcessState>>);
impl FakeHandle {
    /// simulates the process dying on its own
    pub fn exit(&self, code: i32) {
        self.0.lock().unwrap().exit = Some(code);
    }
    pub fn was_terminated(&self) -> bool {
        self.0.lock().unwrap().terminated
    }
    pub fn stderr_was_read(&self) -> bool {
        self.0.lock().unwrap().stderr_read
    }
}

struct FakeProcess(FakeHandle);
#[async_trait]
impl TunnelProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        Ok(self.0.0.lock().unwrap().exit.map(exit_status))
    }
    fn terminate(&mut self) -> io::Result<()> {
        let mut state = self.0.0.lock().unwrap();
        state.terminated = true;
        state.exit.get_or_insert(143);
        Ok(())
    }
    fn force_kill(&mut self) -> io::Result<()> {
        self.0.0.lock().unwrap().exit.get_or_insert(137);
        Ok(())
    }
    async fn wait_timeout(&mut self, _limit: Duration) -> io::Result<Option<ExitStatus>> {
        self.try_wait()
    }
    async fn stderr_tail(&mut self) -> Option<String> {
        self.0.0.lock().unwrap().stderr_read = true;
        None
    }
}

#[derive(Default)]
struct LauncherState {
    launched: Vec<(TunnelSpec, FakeHandle)>,
    fail_next: Option<TunnelError>,
}

/// records every launch and hands out controllable processes
#[derive(Clone, Default)]
pub(crate) struct FakeLauncher(Arc<Mutex<LauncherState>>);
impl FakeLauncher {
    pub fn launched(&self) -> Vec<TunnelSpec> {
        let state = self.0.lock().unwrap();
        state.launched.iter().map(|(spec, _)| spec.clone()).collect()
    }
    /// handles of every process launched for `spec`, oldest first
    pub fn processes(&self, spec: &TunnelSpec) -> Vec<FakeHandle> {
        let state = self.0.lock().unwrap();
        state
            .launched
            .iter()
            .filter(|(launched, _)| launched == spec)
            .map(|(_, handle)| handle.clone())
            .collect()
    }
    /// handle of the latest process launched for `spec`
    pub fn process(&self, spec: &TunnelSpec) -> FakeHandle {
        let state = self.0.lock().unwrap();
        state
            .launched
            .iter()
            .rev()
            .find(|(launched, _)| launched == spec)
            .map(|(_, handle)| handle.clone())
            .expect("spec was never launched")
    }
    pub fn fail_next(&self, err: TunnelError) {
        self.0.lock().unwrap().fail_next = Some(err);
    }
}
impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &TunnelSpec) -> Result<Box<dyn TunnelProcess>, TunnelError> {
        let mut state = self.0.lock().unwrap();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        let handle = FakeHandle::default();
        state.launched.push((spec.clone(), handle.clone()));
        Ok(Box::new(FakeProcess(handle)))
    }
}
