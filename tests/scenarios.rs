use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use rdmatask::ctrl::{open_server_socket, ProtoError, TaskFlags, TaskOp, ACK_MSG};
use rdmatask::prelude::*;
use rdmatask::task::{
    Completion, InitiatorConfig, RdmaBuffer, RdmaTask, ResponderConfig, ServeReport,
};
use rdmatask::utils::Interrupt;

const RESPONDER_ADDR: &str = "10.0.0.1";
const INITIATOR_ADDR: &str = "10.0.0.2";

fn fabric() -> Fabric {
    let fabric = Fabric::new();
    fabric.add_nic("soft0", RESPONDER_ADDR.parse().unwrap()).unwrap();
    fabric.add_nic("soft1", INITIATOR_ADDR.parse().unwrap()).unwrap();
    fabric
}

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn responder_config(size: usize, iters: u64) -> ResponderConfig {
    ResponderConfig {
        addr: addr(RESPONDER_ADDR),
        port: 0,
        size,
        iters,
        ..ResponderConfig::default()
    }
}

fn initiator(fabric: &Fabric, listener: &TcpListener, size: usize, iters: u64, op: TaskOp) -> Initiator {
    let config = InitiatorConfig {
        addr: addr(INITIATOR_ADDR),
        server: "127.0.0.1".to_owned(),
        port: listener.local_addr().unwrap().port(),
        size,
        iters,
        task_flags: TaskFlags::for_op(op),
    };
    Initiator::open(fabric, config).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Io {
    Sent(usize),
    Received(usize),
}

/// Stream wrapper recording the traffic, merging consecutive transfers in
/// the same direction.
struct Recording<S> {
    inner: S,
    log: Vec<Io>,
}

impl<S> Recording<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            log: Vec::new(),
        }
    }
}

impl<S: Read> Read for Recording<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        match self.log.last_mut() {
            Some(Io::Received(total)) => *total += n,
            _ => self.log.push(Io::Received(n)),
        }
        Ok(n)
    }
}

impl<S: Write> Write for Recording<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        match self.log.last_mut() {
            Some(Io::Sent(total)) => *total += n,
            _ => self.log.push(Io::Sent(n)),
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Device wrapper that turns the completion of one chosen work request
/// into a remote access error, once.
struct Faulty {
    inner: RdmaDevice,
    fail_wr_id: u64,
    fired: AtomicBool,
    resets: AtomicUsize,
}

impl Faulty {
    fn new(inner: RdmaDevice, fail_wr_id: u64) -> Self {
        Self {
            inner,
            fail_wr_id,
            fired: AtomicBool::new(false),
            resets: AtomicUsize::new(0),
        }
    }
}

impl OneSidedDevice for Faulty {
    type Buffer = RdmaBuffer;

    fn alloc_buffer(&self, size: usize, kind: MemoryKind) -> Result<RdmaBuffer, TaskError> {
        self.inner.alloc_buffer(size, kind)
    }

    fn descriptor(&self, buf: &RdmaBuffer) -> Result<RemoteBufferDescriptor, TaskError> {
        self.inner.descriptor(buf)
    }

    fn submit(&self, task: &RdmaTask<'_>) -> Result<(), TaskError> {
        self.inner.submit(task)
    }

    fn poll_completions(&self, max: usize) -> Result<Vec<Completion>, TaskError> {
        let mut completions = self.inner.poll_completions(max)?;
        for c in completions.iter_mut() {
            if c.wr_id == self.fail_wr_id && !self.fired.swap(true, Ordering::AcqRel) {
                c.status = WcStatus::RemAccessErr;
            }
        }
        Ok(completions)
    }

    fn reset(&self) -> Result<(), TaskError> {
        self.resets.fetch_add(1, Ordering::AcqRel);
        self.inner.reset()
    }
}

/// Device wrapper whose completions never show up. It sets `interrupt`
/// once it has been polled `trip_after` times.
struct Stalled {
    inner: RdmaDevice,
    interrupt: Interrupt,
    trip_after: usize,
    polls: AtomicUsize,
    resets: AtomicUsize,
}

impl OneSidedDevice for Stalled {
    type Buffer = RdmaBuffer;

    fn alloc_buffer(&self, size: usize, kind: MemoryKind) -> Result<RdmaBuffer, TaskError> {
        self.inner.alloc_buffer(size, kind)
    }

    fn descriptor(&self, buf: &RdmaBuffer) -> Result<RemoteBufferDescriptor, TaskError> {
        self.inner.descriptor(buf)
    }

    fn submit(&self, task: &RdmaTask<'_>) -> Result<(), TaskError> {
        self.inner.submit(task)
    }

    fn poll_completions(&self, _max: usize) -> Result<Vec<Completion>, TaskError> {
        if self.polls.fetch_add(1, Ordering::AcqRel) + 1 == self.trip_after {
            self.interrupt.trigger();
        }
        Ok(Vec::new())
    }

    fn reset(&self) -> Result<(), TaskError> {
        self.resets.fetch_add(1, Ordering::AcqRel);
        self.inner.reset()
    }
}

#[test]
fn test_requests_and_acks_alternate() {
    let fabric = fabric();
    let listener = open_server_socket(0).unwrap();
    let mut responder =
        Responder::open(&fabric, responder_config(4096, 3), Interrupt::new()).unwrap();
    let initiator = initiator(&fabric, &listener, 4096, 3, TaskOp::Write);
    let before = fabric.stats();

    let (served, log) = thread::scope(|s| {
        let served = s.spawn(|| responder.serve(&listener));
        let mut stream = Recording::new(initiator.connect().unwrap());
        let session = initiator.run(&mut stream).unwrap();
        assert_eq!(session.iterations, 3);
        (served.join().unwrap().unwrap(), stream.log)
    });

    let package = ControlPackage::encoded_len();
    assert_eq!(
        log,
        vec![
            Io::Sent(package),
            Io::Received(ACK_MSG.len()),
            Io::Sent(package),
            Io::Received(ACK_MSG.len()),
            Io::Sent(package),
            Io::Received(ACK_MSG.len()),
        ]
    );
    assert_eq!(served.iterations(), 3);
    assert_eq!(served.failures, 0);

    let after = fabric.stats();
    assert_eq!(after.writes - before.writes, 3);
    assert_eq!(after.reads, before.reads);
    assert_eq!(after.bytes - before.bytes, 3 * 4096);
}

#[test]
fn test_flag_selects_direction() {
    let fabric = fabric();
    let listener = open_server_socket(0).unwrap();
    let mut responder =
        Responder::open(&fabric, responder_config(1024, 2), Interrupt::new()).unwrap();

    // Read: the responder pulls the initiator's bytes.
    let reader = initiator(&fabric, &listener, 1024, 2, TaskOp::Read);
    reader.buffer().write(|b| b.fill(0x5a));
    let before = fabric.stats();
    thread::scope(|s| {
        let served = s.spawn(|| responder.serve(&listener));
        let mut stream = reader.connect().unwrap();
        reader.run(&mut stream).unwrap();
        served.join().unwrap().unwrap();
    });
    assert!(responder.buffer().read(|b| b.iter().all(|&x| x == 0x5a)));
    let after = fabric.stats();
    assert_eq!(after.reads - before.reads, 2);
    assert_eq!(after.writes, before.writes);

    // Write: the responder pushes its bytes into the initiator's buffer.
    responder.buffer().write(|b| b.fill(0xc3));
    let writer = initiator(&fabric, &listener, 1024, 2, TaskOp::Write);
    assert_eq!(writer.package().flags.bits() & TaskFlags::READ, 0);
    let before = fabric.stats();
    thread::scope(|s| {
        let served = s.spawn(|| responder.serve(&listener));
        let mut stream = writer.connect().unwrap();
        writer.run(&mut stream).unwrap();
        served.join().unwrap().unwrap();
    });
    assert!(writer.buffer().read(|b| b.iter().all(|&x| x == 0xc3)));
    let after = fabric.stats();
    assert_eq!(after.writes - before.writes, 2);
    assert_eq!(after.reads, before.reads);
}

#[test]
fn test_persistent_reuses_registration() {
    let fabric = fabric();
    let listener = open_server_socket(0).unwrap();
    let config = ResponderConfig {
        persistent: true,
        max_sessions: Some(2),
        num_sges: 4,
        ..responder_config(4096, 5)
    };
    let mut responder = Responder::open(&fabric, config, Interrupt::new()).unwrap();
    let initiator = initiator(&fabric, &listener, 4096, 5, TaskOp::Write);
    let regs = fabric.stats().regs;

    let report: ServeReport = thread::scope(|s| {
        let served = s.spawn(|| responder.serve(&listener));
        for _ in 0..2 {
            let mut stream = initiator.connect().unwrap();
            assert_eq!(initiator.run(&mut stream).unwrap().iterations, 5);
        }
        served.join().unwrap().unwrap()
    });

    assert_eq!(report.sessions.len(), 2);
    assert_eq!(report.iterations(), 10);
    assert_eq!(report.failures, 0);
    assert_eq!(fabric.stats().regs, regs);
}

#[test]
fn test_failed_completion_ends_session() {
    let fabric = fabric();
    let listener = open_server_socket(0).unwrap();
    let config = responder_config(512, 4);
    let device = RdmaDevice::open(&fabric, config.addr).unwrap();
    let buffer = device.alloc_buffer(config.size, config.memory).unwrap();
    let mut responder =
        Responder::new(Faulty::new(device, 2), buffer, config, Interrupt::new()).unwrap();
    let initiator = initiator(&fabric, &listener, 512, 4, TaskOp::Write);

    let (served, run) = thread::scope(|s| {
        let served = s.spawn(|| responder.serve(&listener));
        let mut stream = initiator.connect().unwrap();
        let run = initiator.run(&mut stream);
        (served.join().unwrap(), run)
    });

    assert!(matches!(
        served,
        Err(TaskError::Completion {
            iteration: 2,
            wr_id: 2,
            status: WcStatus::RemAccessErr
        })
    ));
    assert!(matches!(
        run,
        Err(TaskError::Control {
            iteration: 2,
            source: ProtoError::ShortRead { expected: 20, got: 0 }
        })
    ));
    // Reset is for persistent responders only.
    assert_eq!(responder.device().resets.load(Ordering::Acquire), 0);
}

#[test]
fn test_persistent_recovers_from_failure() {
    let fabric = fabric();
    let listener = open_server_socket(0).unwrap();
    let config = ResponderConfig {
        persistent: true,
        max_sessions: Some(2),
        ..responder_config(512, 3)
    };
    let device = RdmaDevice::open(&fabric, config.addr).unwrap();
    let buffer = device.alloc_buffer(config.size, config.memory).unwrap();
    let mut responder =
        Responder::new(Faulty::new(device, 1), buffer, config, Interrupt::new()).unwrap();
    let initiator = initiator(&fabric, &listener, 512, 3, TaskOp::Read);

    let (report, first, second) = thread::scope(|s| {
        let served = s.spawn(|| responder.serve(&listener));
        let mut stream = initiator.connect().unwrap();
        let first = initiator.run(&mut stream);
        drop(stream);
        let mut stream = initiator.connect().unwrap();
        let second = initiator.run(&mut stream);
        (served.join().unwrap().unwrap(), first, second)
    });

    assert!(matches!(first, Err(TaskError::Control { iteration: 1, .. })));
    assert_eq!(second.unwrap().iterations, 3);
    assert_eq!(report.failures, 1);
    assert_eq!(report.sessions.len(), 1);
    assert_eq!(report.iterations(), 3);
    assert_eq!(responder.device().resets.load(Ordering::Acquire), 1);
}

#[test]
fn test_interrupted_before_accepting() {
    let fabric = fabric();
    let listener = open_server_socket(0).unwrap();
    let interrupt = Interrupt::new();
    let mut responder =
        Responder::open(&fabric, responder_config(64, 1), interrupt.clone()).unwrap();
    interrupt.trigger();
    let report = responder.serve(&listener).unwrap();
    assert_eq!(report, ServeReport::default());
}

#[test]
fn test_interrupted_while_polling() {
    let fabric = fabric();
    let listener = open_server_socket(0).unwrap();
    let interrupt = Interrupt::new();
    let config = ResponderConfig {
        persistent: true,
        ..responder_config(512, 3)
    };
    let device = RdmaDevice::open(&fabric, config.addr).unwrap();
    let buffer = device.alloc_buffer(config.size, config.memory).unwrap();
    let stalled = Stalled {
        inner: device,
        interrupt: interrupt.clone(),
        trip_after: 5,
        polls: AtomicUsize::new(0),
        resets: AtomicUsize::new(0),
    };
    let mut responder = Responder::new(stalled, buffer, config, interrupt.clone()).unwrap();
    let initiator = initiator(&fabric, &listener, 512, 3, TaskOp::Write);

    let (served, log, run) = thread::scope(|s| {
        let served = s.spawn(|| {
            let (stream, _) = listener.accept().unwrap();
            let mut stream = Recording::new(stream);
            let served = responder.run_session(&mut stream);
            (served, stream.log)
        });
        let mut stream = initiator.connect().unwrap();
        let run = initiator.run(&mut stream);
        let (served, log) = served.join().unwrap();
        (served, log, run)
    });

    assert!(interrupt.is_set());
    assert!(matches!(served, Err(TaskError::Interrupted)));
    // The request was read and no acknowledgment followed.
    assert_eq!(log, vec![Io::Received(ControlPackage::encoded_len())]);
    assert!(matches!(
        run,
        Err(TaskError::Control {
            iteration: 0,
            source: ProtoError::ShortRead { expected: 20, got: 0 }
        })
    ));
    let device = responder.device();
    assert_eq!(device.polls.load(Ordering::Acquire), 5);
    assert_eq!(device.resets.load(Ordering::Acquire), 0);
}
