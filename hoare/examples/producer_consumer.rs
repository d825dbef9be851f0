//! Move items from producers to consumers through a bounded buffer guarded by a monitor.

use std::collections::VecDeque;
use std::fs::File;
use std::sync::Arc;

use arrrg::CommandLine;
use arrrg_derive::CommandLine;

use biometrics::{Collector, Counter, PlainTextEmitter};

use hoare::{Error, Monitor};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PRODUCED: Counter = Counter::new("producer_consumer.produced");
static CONSUMED: Counter = Counter::new("producer_consumer.consumed");
static BUFFER_FULL: Counter = Counter::new("producer_consumer.buffer_full");
static BUFFER_EMPTY: Counter = Counter::new("producer_consumer.buffer_empty");

fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PRODUCED);
    collector.register_counter(&CONSUMED);
    collector.register_counter(&BUFFER_FULL);
    collector.register_counter(&BUFFER_EMPTY);
}

////////////////////////////////////////////// Options /////////////////////////////////////////////

#[derive(CommandLine, PartialEq)]
struct BufferOptions {
    #[arrrg(optional, "Capacity of the bounded buffer.", "N")]
    capacity: usize,
    #[arrrg(optional, "Number of producer threads.", "N")]
    producers: usize,
    #[arrrg(optional, "Number of consumer threads.", "N")]
    consumers: usize,
    #[arrrg(optional, "Items produced by each producer.", "N")]
    items: u64,
    #[arrrg(flag, "Print biometrics to stdout while running.")]
    biometrics: bool,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            capacity: 10,
            producers: 5,
            consumers: 5,
            items: 10,
            biometrics: false,
        }
    }
}

impl Eq for BufferOptions {}

////////////////////////////////////////////// Buffer //////////////////////////////////////////////

// None tells a consumer to stop.
struct Buffer {
    capacity: usize,
    items: VecDeque<Option<u64>>,
}

fn push(buffer: &Monitor<Buffer>, item: Option<u64>) -> Result<(), Error> {
    buffer.call("push", |b| {
        if b.items.len() == b.capacity {
            BUFFER_FULL.click();
            b.accept(&["pop"])?;
        }
        b.items.push_back(item);
        Ok::<(), Error>(())
    })?
}

fn pop(buffer: &Monitor<Buffer>) -> Result<Option<u64>, Error> {
    buffer.call("pop", |b| {
        if b.items.is_empty() {
            BUFFER_EMPTY.click();
            b.accept(&["push"])?;
        }
        Ok::<_, Error>(b.items.pop_front().flatten())
    })?
}

///////////////////////////////////////////// Producer /////////////////////////////////////////////

fn producer(buffer: Arc<Monitor<Buffer>>, id: u64, items: u64) {
    for n in 0..items {
        push(&buffer, Some(id * items + n)).unwrap();
        PRODUCED.click();
    }
}

///////////////////////////////////////////// Consumer /////////////////////////////////////////////

fn consumer(buffer: Arc<Monitor<Buffer>>) -> u64 {
    let mut sum = 0;
    while let Some(item) = pop(&buffer).unwrap() {
        CONSUMED.click();
        sum += item;
    }
    sum
}

/////////////////////////////////////////////// main ///////////////////////////////////////////////

fn main() {
    let (options, free) = BufferOptions::from_command_line_relaxed(
        "Usage: producer_consumer [--capacity N] [--producers N] [--consumers N] [--items N] [--biometrics]",
    );
    if !free.is_empty() {
        panic!("free arguments are not accepted");
    }
    if options.capacity == 0 {
        panic!("capacity must be positive");
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
    let buffer = Arc::new(
        Monitor::new(
            Buffer {
                capacity: options.capacity,
                items: VecDeque::with_capacity(options.capacity),
            },
            &["push", "pop"],
        )
        .unwrap(),
    );
    let mut consumers = Vec::new();
    for _ in 0..options.consumers {
        let buffer = Arc::clone(&buffer);
        consumers.push(std::thread::spawn(move || consumer(buffer)));
    }
    let mut producers = Vec::new();
    for id in 0..options.producers {
        let buffer = Arc::clone(&buffer);
        let items = options.items;
        producers.push(std::thread::spawn(move || producer(buffer, id as u64, items)));
    }
    for producer in producers.into_iter() {
        producer.join().unwrap();
    }
    for _ in 0..options.consumers {
        push(&buffer, None).unwrap();
    }
    let mut total = 0;
    for (idx, consumer) in consumers.into_iter().enumerate() {
        let sum = consumer.join().unwrap();
        println!("consumer {} summed {}", idx, sum);
        total += sum;
    }
    let n = options.producers as u64 * options.items;
    let expected = if n == 0 { 0 } else { n * (n - 1) / 2 };
    println!("total {} expected {}", total, expected);
    assert_eq!(expected, total);
}
