use criterion::{Criterion, black_box};
use spark_observation::{
    Context, Observation, ObservationRegistry, test_stubs::handlers::AcceptAllHandler,
};
use std::{env, time::Duration};

/// 埋点热路径基准：NOOP 快速路径与一次完整的 start/scope/stop 周期。
///
/// # 设计背景（Why）
/// - 埋点被禁用时调用点仍会执行 `create_not_started`，这条路径必须接近零开销；
/// - 完整周期覆盖 Handler 筛选、Convention 决议、Filter 链与线程作用域栈，便于发现锁或分配上的回归。
///
/// # 逻辑解析（How）
/// - `noop`：Registry 未注册 Handler，Context 工厂不应被调用；
/// - `predicate_rejected`：注册了 Handler，但 Predicate 拒绝；
/// - `full_cycle`：一个空 Handler、一个 Filter，执行 `observe`。
fn bench_observation(c: &mut Criterion) {
    let empty = ObservationRegistry::create();
    c.bench_function("observation/noop", |b| {
        b.iter(|| {
            let observation = Observation::create_not_started(black_box("noop"), &empty);
            black_box(observation.is_noop())
        });
    });

    let rejecting = ObservationRegistry::create();
    rejecting
        .config()
        .add_handler(AcceptAllHandler)
        .add_predicate(|_: &str, _: &Context| false);
    c.bench_function("observation/predicate_rejected", |b| {
        b.iter(|| {
            let observation = Observation::create_not_started(black_box("rejected"), &rejecting);
            black_box(observation.is_noop())
        });
    });

    let active = ObservationRegistry::create();
    active
        .config()
        .add_handler(AcceptAllHandler)
        .add_filter(|context: Context| context.with_low_cardinality_key_value(("region", "eu")));
    c.bench_function("observation/full_cycle", |b| {
        b.iter(|| {
            let observation = Observation::create_not_started(black_box("cycle"), &active);
            observation.low_cardinality_key_value(("status", "ok"));
            black_box(observation.observe(|| black_box(1_u64)))
        });
    });
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_observation(&mut criterion);
    criterion.final_summary();
}
