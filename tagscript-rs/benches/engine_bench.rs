use std::collections::HashMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tagscript::pattern::{MatchMode, Pattern};
use tagscript::script::{block, compile_source, Registries};
use tagscript::Engine;

const LOOP_SCRIPT: &str = "\
define total 0;
define names <{list[alpha|beta|gamma|delta]}>;
repeat 200 --as=i {
    if <{var[i].is_greater_than[100]}> {
        set total += <{var[i]}>;
    }
    else {
        set total -= 1;
    }
}
foreach <{var[names]}> --as=name {
    define upper <{var[name].to_upper}>;
}
determine <{var[total]}>";

fn make_source(repeats: usize) -> String {
    let chunk = "define x<N> <{integer[3].add[4]}>; if <{var[x<N>].is_greater_than[5]}> { echo <{var[x<N>]}> } else { noop }; ";
    (0..repeats).map(|n| chunk.replace("<N>", &n.to_string())).collect()
}

fn bench_compile(c: &mut Criterion) {
    let reg = Registries::builtin();
    let small = make_source(10);
    let large = make_source(500);

    let mut g = c.benchmark_group("compile");
    g.bench_function("parse_small", |b| b.iter(|| block::parse(black_box(&small), &reg.commands)));
    g.bench_function("parse_large", |b| b.iter(|| block::parse(black_box(&large), &reg.commands)));
    g.bench_function("compile_small", |b| b.iter(|| compile_source("bench", black_box(&small), &reg, &[])));
    g.bench_function("compile_large", |b| b.iter(|| compile_source("bench", black_box(&large), &reg, &[])));
    g.finish();
}

fn bench_execute(c: &mut Criterion) {
    let mut engine = Engine::new(Arc::new(|_: &str, _| {}));
    let looping = engine.script_from_source("loop", LOOP_SCRIPT);
    let straight = engine.script_from_source("straight", &make_source(100));

    let mut g = c.benchmark_group("execute");
    g.bench_function("loop_200", |b| b.iter(|| engine.execute_script(black_box(&looping), HashMap::new())));
    g.bench_function("straight_100", |b| b.iter(|| engine.execute_script(black_box(&straight), HashMap::new())));
    g.finish();
}

fn bench_patterns(c: &mut Criterion) {
    let hay = "The quick brown FOX jumps over the lazy dog. ".repeat(1000);
    let substr = Pattern::new("lazy", MatchMode::Substr).unwrap();
    let any = Pattern::new("cat|bird|lazy", MatchMode::AnyOf).unwrap();
    let glob = Pattern::new("*brown*dog*", MatchMode::Glob).unwrap();

    let mut g = c.benchmark_group("pattern");
    g.bench_function("substr", |b| b.iter(|| substr.matches(black_box(&hay))));
    g.bench_function("any_of", |b| b.iter(|| any.matches(black_box(&hay))));
    g.bench_function("glob", |b| b.iter(|| glob.matches(black_box(&hay))));
    g.finish();
}

criterion_group!(benches, bench_compile, bench_execute, bench_patterns);
criterion_main!(benches);
