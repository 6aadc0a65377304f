// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use farmem::rpc::Serializer;

// The serializer sits on the hot path of every call and eviction; keep an
// eye on large-buffer throughput.
fn serialization_benchmark(c: &mut Criterion) {
    let i: u32 = 16 * 1024 * 1024;
    let buf = (0..i).map(|i| (i % 256) as u8).collect::<Vec<_>>();

    c.bench_function("serialize", |b| {
        b.iter(|| {
            let mut ser = Serializer::new();
            ser.write(&buf);
            ser.into_buffer()
        });
    });

    let mut ser = Serializer::new();
    ser.write(&buf);
    let encoded = ser.into_buffer();
    c.bench_function("deserialize", |b| {
        b.iter(|| {
            Serializer::from(encoded.clone())
                .read::<Vec<u8>>()
                .unwrap()
        });
    });
}

criterion_group!(benches, serialization_benchmark);
criterion_main!(benches);
