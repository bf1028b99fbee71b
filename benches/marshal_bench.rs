use ajs_bridge::marshal::marshal_args;
use ajs_bridge::unmarshal::unmarshal_args;
use ajs_bridge::wire::BodyWriter;
use ajs_bridge::{ObjectMap, ScriptValue};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn create_dict(entries: usize) -> ScriptValue {
    let mut map = ObjectMap::new();
    for i in 0..entries {
        let variant = ObjectMap::new().with("s", format!("value-{}", i));
        map.insert(format!("key{}", i), ScriptValue::Object(variant));
    }
    ScriptValue::Object(map)
}

fn marshal(signature: &str, args: &[ScriptValue]) -> Vec<u8> {
    let mut writer = BodyWriter::new(signature);
    marshal_args(&mut writer, args).unwrap();
    writer.finish().unwrap()
}

fn bench_marshal(c: &mut Criterion) {
    let scalars = vec![
        ScriptValue::Number(7.0),
        ScriptValue::Number(-3.0),
        ScriptValue::from("hello"),
        ScriptValue::Bool(true),
    ];
    c.bench_function("marshal_scalars", |b| {
        b.iter(|| marshal(black_box("iisb"), black_box(&scalars)))
    });

    let dict = vec![create_dict(32)];
    c.bench_function("marshal_dict_32", |b| b.iter(|| marshal(black_box("a{sv}"), black_box(&dict))));

    let buffer = vec![ScriptValue::Buffer(vec![0xA5; 4096])];
    c.bench_function("marshal_byte_array_4k", |b| {
        b.iter(|| marshal(black_box("ay"), black_box(&buffer)))
    });

    let numbers: Vec<ScriptValue> = (0..4096).map(|i| ScriptValue::Number((i % 256) as f64)).collect();
    let array = vec![ScriptValue::Array(numbers)];
    c.bench_function("marshal_byte_elements_4k", |b| {
        b.iter(|| marshal(black_box("ay"), black_box(&array)))
    });
}

fn bench_unmarshal(c: &mut Criterion) {
    let body = marshal("a{sv}", &[create_dict(32)]);
    c.bench_function("unmarshal_dict_32", |b| {
        b.iter(|| {
            let mut reader = ajs_bridge::wire::BodyReader::new(black_box(&body), "a{sv}");
            unmarshal_args(&mut reader).unwrap()
        })
    });

    let structs: Vec<ScriptValue> = (0..64)
        .map(|i| ScriptValue::Array(vec![ScriptValue::Number(i as f64), ScriptValue::from("path")]))
        .collect();
    let body = marshal("a(us)", &[ScriptValue::Array(structs)]);
    c.bench_function("unmarshal_struct_array_64", |b| {
        b.iter(|| {
            let mut reader = ajs_bridge::wire::BodyReader::new(black_box(&body), "a(us)");
            unmarshal_args(&mut reader).unwrap()
        })
    });
}

criterion_group!(benches, bench_marshal, bench_unmarshal);
criterion_main!(benches);
