//! Seat philosophers around a table guarded by a monitor and let them eat.

use std::fs::File;
use std::sync::Arc;

use arrrg::CommandLine;
use arrrg_derive::CommandLine;

use biometrics::{Collector, Counter, PlainTextEmitter};

use guacamole::Guacamole;

use hoare::Monitor;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static MEALS: Counter = Counter::new("dining_philosophers.meals");
static WAITED_FOR_FORKS: Counter = Counter::new("dining_philosophers.waited_for_forks");

fn register_biometrics(collector: &Collector) {
    collector.register_counter(&MEALS);
    collector.register_counter(&WAITED_FOR_FORKS);
}

////////////////////////////////////////////// Options /////////////////////////////////////////////

#[derive(CommandLine, PartialEq)]
struct DiningOptions {
    #[arrrg(optional, "Number of philosophers seated at the table.", "N")]
    philosophers: usize,
    #[arrrg(optional, "Meals each philosopher eats before leaving.", "MEALS")]
    meals: u64,
    #[arrrg(optional, "Guacamole seed for think and eat times.", "SEED")]
    seed: u64,
    #[arrrg(flag, "Print biometrics to stdout while running.")]
    biometrics: bool,
}

impl Default for DiningOptions {
    fn default() -> Self {
        Self {
            philosophers: 5,
            meals: 2_000,
            seed: 0,
            biometrics: false,
        }
    }
}

impl Eq for DiningOptions {}

/////////////////////////////////////////////// Table //////////////////////////////////////////////

struct Table {
    forks: Vec<bool>,
    meals: Vec<u64>,
}

impl Table {
    fn new(philosophers: usize) -> Self {
        Self {
            forks: vec![false; philosophers],
            meals: vec![0; philosophers],
        }
    }

    fn forks_of(&self, philosopher: usize) -> (usize, usize) {
        (philosopher, (philosopher + 1) % self.forks.len())
    }
}

//////////////////////////////////////////// Philosopher ///////////////////////////////////////////

fn pause(guac: &mut Guacamole) {
    let mut buf = [0u8; 1];
    guac.generate(&mut buf);
    std::thread::sleep(std::time::Duration::from_micros(buf[0] as u64));
}

fn philosopher(table: Arc<Monitor<Table>>, seat: usize, meals: u64, seed: u64) {
    let mut guac = Guacamole::new(seed);
    for _ in 0..meals {
        pause(&mut guac);
        table
            .call("pick_up_forks", |t| {
                let (right, left) = t.forks_of(seat);
                while t.forks[right] || t.forks[left] {
                    WAITED_FOR_FORKS.click();
                    t.accept(&["pick_up_forks", "put_down_forks"])?;
                }
                t.forks[right] = true;
                t.forks[left] = true;
                Ok::<(), hoare::Error>(())
            })
            .and_then(|r| r)
            .unwrap();
        pause(&mut guac);
        MEALS.click();
        table
            .call("put_down_forks", |t| {
                let (right, left) = t.forks_of(seat);
                t.forks[right] = false;
                t.forks[left] = false;
                t.meals[seat] += 1;
            })
            .unwrap();
    }
}

/////////////////////////////////////////////// main ///////////////////////////////////////////////

fn main() {
    let (options, free) = DiningOptions::from_command_line_relaxed(
        "Usage: dining_philosophers [--philosophers N] [--meals MEALS] [--seed SEED] [--biometrics]",
    );
    if !free.is_empty() {
        panic!("free arguments are not accepted");
    }
    if options.philosophers < 2 {
        panic!("a table needs at least two philosophers");
    }
    if options.biometrics {
        std::thread::spawn(|| {
            let collector = Collector::new();
            register_biometrics(&collector);
            hoare::register_biometrics(&collector);
            let fout = File::create("/dev/stdout").unwrap();
            let mut emit = PlainTextEmitter::new(fout);
            loop {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::SystemTime::UNIX_EPOCH)
                    .expect("clock should never fail")
                    .as_millis()
                    .try_into()
                    .expect("millis since epoch should fit u64");
                if let Err(e) = collector.emit(&mut emit, now) {
                    eprintln!("collector error: {}", e);
                }
                std::thread::sleep(std::time::Duration::from_millis(250));
            }
        });
    }
    let table = Arc::new(
        Monitor::new(
            Table::new(options.philosophers),
            &["pick_up_forks", "put_down_forks"],
        )
        .unwrap(),
    );
    let mut threads = Vec::new();
    for seat in 0..options.philosophers {
        let table = Arc::clone(&table);
        let meals = options.meals;
        let seed = options.seed.wrapping_add(seat as u64);
        threads.push(std::thread::spawn(move || {
            philosopher(table, seat, meals, seed);
        }));
    }
    for thread in threads.into_iter() {
        thread.join().unwrap();
    }
    let table = Arc::try_unwrap(table).unwrap().into_inner();
    for (seat, meals) in table.meals.iter().enumerate() {
        println!("philosopher {} ate {} meals", seat, meals);
    }
}
