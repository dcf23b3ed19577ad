use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use stackprof::{Address, Capture, Error, InterruptFrame, Profiler, StackBounds, TimerSource};
use stackprof_frontend::{dump, dump_folded, export, DumpError, Grouping, NoSymbols, SymbolTable};

#[derive(Default)]
struct TestTimer {
    period_us: AtomicU32,
    enabled: AtomicBool,
    enables: AtomicUsize,
}

impl TimerSource for TestTimer {
    fn configure(&self, period_us: u32) {
        self.period_us.store(period_us, Ordering::Relaxed);
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
        self.enables.fetch_add(1, Ordering::Relaxed);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }
}

const BUSY_LOOP: Address = 0x8124;
const DELAY: Address = 0x8210;

/// Delivers one timer interrupt, as long as the timer is enabled.
fn interrupt(prof: &Profiler<TestTimer>, pc: Address) -> Option<Capture> {
    if !prof.timer().enabled.load(Ordering::Relaxed) {
        return None;
    }
    let frame = InterruptFrame {
        pc,
        fp: 0,
        stack: StackBounds::EMPTY,
    };
    Some(prof.tick(&frame).expect("profiler is initialized"))
}

/// Ten periods of a loop that spins on every third iteration and sleeps otherwise.
fn workload(prof: &Profiler<TestTimer>) -> usize {
    (0..10)
        .filter_map(|i| interrupt(prof, if i % 3 == 0 { BUSY_LOOP } else { DELAY }))
        .count()
}

fn symbols() -> SymbolTable {
    SymbolTable::parse_nm("00008100 T main\n00008200 T delay\n")
}

fn render(prof: &Profiler<TestTimer>, grouping: Grouping) -> String {
    let mut out = String::new();
    dump(prof, &mut out, &symbols(), grouping).unwrap();
    out
}

#[test]
fn ten_periods_with_plenty_of_room() {
    let prof = Profiler::with_timer(TestTimer::default());
    prof.init(1_000_000, 4000).unwrap();
    assert_eq!(prof.timer().period_us.load(Ordering::Relaxed), 1_000_000);

    prof.on().unwrap();
    let ticks = workload(&prof);
    prof.off().unwrap();
    assert_eq!(ticks, 10);

    {
        let samples = prof.samples().unwrap();
        assert_eq!(samples.len() + samples.dropped_count(), 10);
        assert_eq!(samples.dropped_count(), 0);
    }

    let text = render(&prof, Grouping::FullTrace);
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("stackprof: 10 samples captured, 10 ticks, 0 dropped, period 1000000 us, capacity 4000")
    );
    assert_eq!(
        lines.next(),
        Some("stackprof: grouped by full trace, leaf first, 2 unique")
    );
    assert!(!text.contains("lower bound"));
    assert!(text.contains("       6   60.0%"));
    assert!(text.contains("delay+0x10"));
    assert!(text.contains("       4   40.0%"));
    assert!(text.contains("main+0x24"));
}

#[test]
fn tiny_buffer_drops_the_rest() {
    let prof = Profiler::with_timer(TestTimer::default());
    prof.init(100, 2).unwrap();
    prof.on().unwrap();
    let outcomes: Vec<_> = (0..5).filter_map(|_| interrupt(&prof, DELAY)).collect();
    prof.off().unwrap();

    assert_eq!(
        outcomes.iter().filter(|c| **c == Capture::Dropped).count(),
        3
    );
    let samples = prof.samples().unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples.dropped_count(), 3);
    drop(samples);

    let text = render(&prof, Grouping::Leaf);
    assert!(text.starts_with("stackprof: 2 samples captured, 5 ticks, 3 dropped"));
    assert!(text.contains("3 samples dropped, counts are a lower bound"));
    assert!(text.contains("grouped by leaf address"));
}

#[test]
fn repeated_dumps_agree() {
    let prof = Profiler::with_timer(TestTimer::default());
    prof.init(1000, 64).unwrap();
    prof.on().unwrap();
    workload(&prof);
    prof.off().unwrap();

    let first = render(&prof, Grouping::FullTrace);
    let second = render(&prof, Grouping::FullTrace);
    assert_eq!(first, second);
    prof.off().unwrap();
    assert_eq!(render(&prof, Grouping::FullTrace), first);
}

#[test]
fn double_on_enables_the_timer_once() {
    let prof = Profiler::with_timer(TestTimer::default());
    prof.init(1000, 64).unwrap();
    prof.on().unwrap();
    prof.on().unwrap();
    assert_eq!(prof.timer().enables.load(Ordering::Relaxed), 1);

    let ticks = workload(&prof);
    prof.off().unwrap();
    assert_eq!(prof.samples().unwrap().ticks(), ticks);
    assert_eq!(ticks, 10);
}

#[test]
fn dump_is_refused_at_the_wrong_time() {
    let prof = Profiler::with_timer(TestTimer::default());
    let mut out = String::new();

    assert_eq!(
        dump(&prof, &mut out, &NoSymbols, Grouping::FullTrace),
        Err(DumpError::Profiler(Error::NotInitialized))
    );

    prof.init(1000, 8).unwrap();
    prof.on().unwrap();
    assert_eq!(
        dump(&prof, &mut out, &NoSymbols, Grouping::FullTrace),
        Err(DumpError::Profiler(Error::Active))
    );
    assert!(out.is_empty());

    prof.off().unwrap();
    dump(&prof, &mut out, &NoSymbols, Grouping::FullTrace).unwrap();
    assert!(out.starts_with("stackprof: 0 samples captured"));
}

#[test]
fn folded_stacks_for_flame_graphs() {
    let prof = Profiler::with_timer(TestTimer::default());
    let mut out = String::new();
    assert_eq!(
        dump_folded(&prof, &mut out, &symbols()),
        Err(DumpError::Profiler(Error::NotInitialized))
    );

    prof.init(1000, 64).unwrap();
    prof.on().unwrap();
    assert_eq!(
        dump_folded(&prof, &mut out, &symbols()),
        Err(DumpError::Profiler(Error::Active))
    );
    assert!(out.is_empty());

    workload(&prof);
    prof.off().unwrap();
    dump_folded(&prof, &mut out, &symbols()).unwrap();
    assert_eq!(out, "delay 6\nmain 4\n");

    // still readable afterwards
    let mut again = String::new();
    dump_folded(&prof, &mut again, &NoSymbols).unwrap();
    assert_eq!(again, "0x8210 6\n0x8124 4\n");
}

#[test]
fn raw_export_reproduces_the_report() {
    let prof = Profiler::with_timer(TestTimer::default());
    prof.init(250, 4).unwrap();
    prof.on().unwrap();
    workload(&prof);
    prof.off().unwrap();

    let bytes = export(&prof).unwrap();
    let profile = stackprof_frontend::export::decode(&bytes).unwrap();
    assert_eq!(profile.summary.ticks, 10);
    assert_eq!(profile.summary.dropped, 6);

    let offline = profile.report(Grouping::FullTrace).display(&symbols()).to_string();
    assert_eq!(offline, render(&prof, Grouping::FullTrace));
}
