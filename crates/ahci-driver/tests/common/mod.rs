#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use ahci_driver::{AhciController, DmaMemory, EventSink, Host, MonotonicClock, SgFragment};
use ahci_sim::{SimDrive, SimHba, SimHbaConfig, SimMemory};

/// Records topology-change notifications from the driver.
pub struct RecordingSink {
    changes: Mutex<Vec<usize>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            changes: Mutex::new(Vec::new()),
        }
    }

    pub fn changes(&self) -> Vec<usize> {
        self.changes.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn topology_changed(&self, port: usize) {
        self.changes.lock().unwrap().push(port);
    }
}

/// A controller wired to the simulated HBA over simulated physical memory.
pub struct TestRig {
    pub mem: Arc<SimMemory>,
    pub hba: Arc<SimHba>,
    pub ctl: Arc<AhciController>,
    pub sink: Arc<RecordingSink>,
}

impl TestRig {
    pub fn new(config: SimHbaConfig) -> Self {
        let mem = Arc::new(SimMemory::new());
        let hba = Arc::new(SimHba::new(mem.clone(), config));
        let sink = Arc::new(RecordingSink::new());
        let ctl = Arc::new(AhciController::new(host(&mem, &hba, &sink)));
        Self {
            mem,
            hba,
            ctl,
            sink,
        }
    }

    /// One LBA48 drive on port 0, brought all the way up; the command trace
    /// starts empty.
    pub fn with_drive(total_sectors: u64) -> Self {
        let rig = Self::new(SimHbaConfig::default());
        rig.hba.attach_drive(0, SimDrive::new(total_sectors));
        rig.ctl.reset().unwrap();
        assert!(rig.ctl.probe_port(0).unwrap());
        rig.enumerate(0);
        rig.hba.clear_trace();
        rig
    }

    /// Swaps in a fresh driver instance over the same device and memory, as
    /// after a host restart.
    pub fn restart_controller(&mut self) {
        self.ctl = Arc::new(AhciController::new(host(&self.mem, &self.hba, &self.sink)));
    }

    /// Delivers latched interrupts through both pipeline stages until the
    /// line is quiet.
    pub fn pump(&self) {
        while self.ctl.interrupt_service() {
            self.ctl.interrupt_dpc();
        }
        self.ctl.interrupt_dpc();
    }

    /// Runs `f` with a background thread servicing interrupts, for driver
    /// paths that busy-wait on command completion.
    pub fn with_pump<T>(&self, f: impl FnOnce() -> T) -> T {
        let stop = Arc::new(AtomicBool::new(false));
        let ctl = self.ctl.clone();
        let flag = stop.clone();
        let pump = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                ctl.interrupt_service();
                ctl.interrupt_dpc();
                thread::yield_now();
            }
        });
        let out = f();
        stop.store(true, Ordering::Relaxed);
        pump.join().unwrap();
        out
    }

    pub fn enumerate(&self, port: usize) -> u64 {
        self.with_pump(|| self.ctl.enumerate_port(port)).unwrap()
    }
}

fn host(mem: &Arc<SimMemory>, hba: &Arc<SimHba>, sink: &Arc<RecordingSink>) -> Host {
    Host {
        mmio: hba.clone(),
        mem: mem.clone(),
        dma: mem.clone(),
        clock: Arc::new(MonotonicClock::new()),
        events: sink.clone(),
    }
}

/// Deterministic non-repeating byte pattern.
pub fn pattern(seed: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let x = seed
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .wrapping_add(i as u64);
            (x ^ (x >> 7)) as u8
        })
        .collect()
}

/// Scatters `data` across the fragment list in simulated memory.
pub fn stage(mem: &SimMemory, fragments: &[SgFragment], data: &[u8]) {
    let mut off = 0;
    for fragment in fragments {
        if off == data.len() {
            break;
        }
        let take = fragment.len.min(data.len() - off);
        mem.write_physical(fragment.phys, &data[off..off + take]);
        off += take;
    }
    assert_eq!(off, data.len(), "fragment list smaller than data");
}

/// Gathers `len` bytes back out of the fragment list.
pub fn collect(mem: &SimMemory, fragments: &[SgFragment], len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    let mut off = 0;
    for fragment in fragments {
        if off == len {
            break;
        }
        let take = fragment.len.min(len - off);
        mem.read_physical(fragment.phys, &mut data[off..off + take]);
        off += take;
    }
    assert_eq!(off, len, "fragment list smaller than requested length");
    data
}

/// A contiguous run of `count` fragments of `frag_len` bytes starting at
/// `base`.
pub fn contiguous_fragments(base: u64, frag_len: usize, count: usize) -> Vec<SgFragment> {
    (0..count)
        .map(|i| SgFragment {
            phys: base + (i * frag_len) as u64,
            len: frag_len,
        })
        .collect()
}
