/// Hot-path gate benchmarks
///
/// Every admitted request pays for the route lookup, two window checks and a
/// breaker check before dispatch; these should stay in the low microseconds.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use plugin_gateway::config::{CircuitBreakerConfig, Config, RateLimitingConfig};
use plugin_gateway::discovery::InMemoryRegistry;
use plugin_gateway::mesh::CircuitBreaker;
use plugin_gateway::plugin::{DefaultPluginLoader, LoaderLimits, PluginConfig, PluginRequest};
use plugin_gateway::ratelimit::{PluginRateLimiter, SlidingWindow};
use plugin_gateway::PluginGateway;
use std::sync::Arc;
use std::time::Duration;

fn bench_sliding_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("SlidingWindow");

    for keys in [1usize, 1_000] {
        let windows = SlidingWindow::new();
        let names: Vec<String> = (0..keys).map(|i| format!("ip:10.0.{}.{}", i / 256, i % 256)).collect();
        let mut n = 0usize;
        group.bench_with_input(BenchmarkId::new("check", keys), &keys, |b, _| {
            b.iter(|| {
                n = n.wrapping_add(1);
                let key = &names[n % names.len()];
                black_box(windows.check(key, u32::MAX, Duration::from_millis(1)))
            });
        });
    }

    group.finish();
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("CircuitBreaker");
    let cb = CircuitBreaker::new(CircuitBreakerConfig::default());

    group.bench_function("allow_and_record_success", |b| {
        b.iter(|| {
            let allowed = cb.allow(black_box("svc")).is_ok();
            cb.record_success("svc");
            black_box(allowed)
        });
    });

    group.finish();
}

fn bench_plugin_limiter(c: &mut Criterion) {
    let limiter = PluginRateLimiter::new(&RateLimitingConfig {
        requests_per_second: u32::MAX / 2,
        burst_size: 0,
        window_ms: 1,
    });

    c.bench_function("PluginRateLimiter/allow", |b| {
        b.iter(|| black_box(limiter.allow(black_box("svc")).is_ok()));
    });
}

fn bench_gateway_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut config = Config::default();
    config.rate_limiting.requests_per_second = u32::MAX / 2;
    config.rate_limiting.window_ms = 1;

    let gateway = rt.block_on(async {
        let loader = Arc::new(DefaultPluginLoader::with_builtins(LoaderLimits::default()));
        let gateway = PluginGateway::new(config, Arc::new(InMemoryRegistry::new()), loader).unwrap();
        gateway
            .load_plugin("echo", PluginConfig::native("echo", "echo"))
            .await
            .unwrap();
        gateway
    });

    c.bench_function("PluginGateway/handle_request_echo", |b| {
        b.to_async(&rt).iter(|| async {
            let resp = gateway
                .handle_request(black_box(PluginRequest::new("GET", "/api/echo/ping")))
                .await;
            black_box(resp)
        });
    });
}

criterion_group!(
    benches,
    bench_sliding_window,
    bench_circuit_breaker,
    bench_plugin_limiter,
    bench_gateway_dispatch
);
criterion_main!(benches);
