//! Kernel hot-path benchmarks.
//!
//! - Event bus publish with one and with many subscribers
//! - Command dispatch through the command bus
//! - Request dispatch through the mediator with the standard behaviors
//!
//! Run with: `cargo bench`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use futures::future::BoxFuture;
use serde_json::json;
use wiz_kernel_core::{Command, CommandHandler, Event, KernelResult, Request, RequestHandler};
use wiz_kernel_runtime::mediator::behaviors::{
    LoggingBehavior, PerformanceMonitoringBehavior, ValidationBehavior,
};
use wiz_kernel_runtime::{CommandBus, EventBus, Mediator, SubscribeOptions};

struct Increment(u64);

impl Command for Increment {
    type Output = u64;
    const COMMAND_TYPE: &'static str = "Increment";
}

struct IncrementHandler;

impl CommandHandler<Increment> for IncrementHandler {
    fn handle(&self, command: Increment) -> BoxFuture<'_, KernelResult<u64>> {
        Box::pin(async move { Ok(command.0 + 1) })
    }
}

struct Echo(u64);

impl Request for Echo {
    type Response = u64;
    const REQUEST_TYPE: &'static str = "Echo";

    fn request_id(&self) -> &str {
        "bench"
    }
}

struct EchoHandler;

impl RequestHandler<Echo> for EchoHandler {
    fn handle(&self, request: Echo) -> BoxFuture<'_, KernelResult<u64>> {
        Box::pin(async move { Ok(request.0) })
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn benchmark_event_bus(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_bus");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    for subscribers in [1_usize, 10] {
        let bus = EventBus::default();
        for priority in 0..subscribers {
            bus.subscribe(
                "bench.event",
                |_event| async { Ok(()) },
                SubscribeOptions::new().priority(i32::try_from(priority).unwrap_or_default()),
            );
        }

        group.bench_function(format!("publish_{subscribers}_subscribers"), |b| {
            b.to_async(&runtime).iter(|| async {
                let event = Event::new("bench.event", json!({ "n": 1 }));
                let _ = bus.publish(black_box(event)).await;
            });
        });
    }

    group.finish();
}

fn benchmark_command_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_bus");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    let bus = CommandBus::default();
    bus.register(IncrementHandler).expect("register handler");

    group.bench_function("execute", |b| {
        b.to_async(&runtime).iter(|| async {
            let _ = bus.execute(black_box(Increment(1))).await;
        });
    });

    group.finish();
}

fn benchmark_mediator(c: &mut Criterion) {
    let mut group = c.benchmark_group("mediator");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    let mediator = Mediator::default();
    mediator
        .register_request_handler(EchoHandler)
        .expect("register handler");
    mediator.register_behavior(LoggingBehavior);
    mediator.register_behavior(ValidationBehavior::new(|_| Ok(())));
    mediator.register_behavior(PerformanceMonitoringBehavior::default());

    group.bench_function("send_with_behaviors", |b| {
        b.to_async(&runtime).iter(|| async {
            let _ = mediator.send(black_box(Echo(7))).await;
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_event_bus,
    benchmark_command_dispatch,
    benchmark_mediator,
);
criterion_main!(benches);
