//! GEMM Benchmark Suite
//!
//! Benchmarks for the packed GEMM that backs the convolution family:
//! - Naive row-major GEMM as the baseline
//! - Packed GEMM, single-threaded and on a rayon pool
//! - Operand packing cost on its own
//!
//! Run with: `cargo bench --bench gemm_bench`

use std::hint::black_box;
use std::time::{Duration, Instant};

use shl::backend::VectorProfile;
use shl::kernels::gemm::{gemm_naive, gemm_packed, reorder_input, reorder_kernel};
use shl::parallel::{make_pool, SerialPool};
use shl::DType;

// ============================================================================
// Benchmark Harness
// ============================================================================

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(10),
        }
    }

    fn run_time<F, R>(&self, mut f: F) -> BenchmarkResult
    where
        F: FnMut() -> R,
    {
        for _ in 0..self.warmup_iterations {
            black_box(f());
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            black_box(f());
            durations.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            iterations: self.iterations,
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    iterations: usize,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self) {
        let avg = self.avg();
        let min = *self.durations.iter().min().unwrap();
        let max = *self.durations.iter().max().unwrap();

        let mut sorted = self.durations.clone();
        sorted.sort();
        let p50 = sorted[sorted.len() / 2];
        let p95 = sorted[(sorted.len() * 95) / 100];
        let p99 = sorted[(sorted.len() * 99) / 100];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", self.iterations);
        println!("Average: {:?} ({:.3} ms)", avg, avg.as_secs_f64() * 1000.0);
        println!("Min:     {:?} ({:.3} ms)", min, min.as_secs_f64() * 1000.0);
        println!("Max:     {:?} ({:.3} ms)", max, max.as_secs_f64() * 1000.0);
        println!("P50:     {:?} ({:.3} ms)", p50, p50.as_secs_f64() * 1000.0);
        println!("P95:     {:?} ({:.3} ms)", p95, p95.as_secs_f64() * 1000.0);
        println!("P99:     {:?} ({:.3} ms)", p99, p99.as_secs_f64() * 1000.0);
        println!("Throughput: {:.2} ops/sec", 1_000_000_000.0 / avg.as_nanos() as f64);
    }

    fn report_with_gflops(&self, m: usize, n: usize, k: usize) {
        self.report();
        // one multiply-add per (i, j, l)
        let flops = 2.0 * m as f64 * n as f64 * k as f64;
        println!("GFLOPS: {:.2}", flops / (self.avg_ms() / 1000.0) / 1e9);
    }

    fn avg(&self) -> Duration {
        let total: Duration = self.durations.iter().sum();
        total / self.iterations as u32
    }

    fn avg_ms(&self) -> f64 {
        self.avg().as_secs_f64() * 1000.0
    }
}

// ============================================================================
// Test Data Generation
// ============================================================================

/// Row-major `A[m x k]` and `B[k x n]`
fn generate_test_matrices(m: usize, n: usize, k: usize) -> (Vec<f32>, Vec<f32>) {
    let a = (0..m * k).map(|i| (i as f32 * 0.01).sin() * 0.1).collect();
    let b = (0..k * n).map(|i| (i as f32 * 0.01).cos() * 0.1).collect();
    (a, b)
}

/// Shapes of the GEMMs a 1x1 convolution produces: (out_c, in_c, h * w)
const SHAPES: [(usize, usize, usize); 3] = [(32, 16, 56 * 56), (64, 64, 28 * 28), (128, 256, 14 * 14)];

// ============================================================================
// Benchmarks
// ============================================================================

fn benchmark_naive() {
    println!("\n--- Naive GEMM ---");
    for (m, k, n) in SHAPES {
        let (a, b) = generate_test_matrices(m, n, k);
        let bench = Benchmark::new(&format!("naive {}x{}x{}", m, k, n), 20);
        bench
            .run_time(|| gemm_naive(&a, &b, None, m, k, n))
            .report_with_gflops(m, n, k);
    }
}

fn benchmark_packed(threads: usize) {
    println!("\n--- Packed GEMM ({} threads) ---", threads);
    let nr = VectorProfile::VLEN_128.packn(DType::Float32) * 2;
    let pool = make_pool(threads);
    for (m, k, n) in SHAPES {
        let (a, b) = generate_test_matrices(m, n, k);
        let mut a_pack = vec![0.0f32; m * k];
        let mut b_pack = vec![0.0f32; k * n];
        reorder_kernel(&a, &mut a_pack, m, k);
        reorder_input(&b, &mut b_pack, k, n, nr);
        let mut c = vec![0.0f32; m * n];

        let bench = Benchmark::new(&format!("packed {}x{}x{} t{}", m, k, n, threads), 50);
        bench
            .run_time(|| gemm_packed(pool.as_ref(), &mut c, &a_pack, &b_pack, None, m, k, n, nr))
            .report_with_gflops(m, n, k);
    }
}

fn benchmark_packing() {
    println!("\n--- Operand packing ---");
    let nr = VectorProfile::VLEN_128.packn(DType::Float32) * 2;
    for (m, k, n) in SHAPES {
        let (a, b) = generate_test_matrices(m, n, k);
        let mut a_pack = vec![0.0f32; m * k];
        let mut b_pack = vec![0.0f32; k * n];
        Benchmark::new(&format!("reorder_kernel {}x{}", m, k), 100)
            .run_time(|| reorder_kernel(&a, &mut a_pack, m, k))
            .report();
        Benchmark::new(&format!("reorder_input {}x{}", k, n), 100)
            .run_time(|| reorder_input(&b, &mut b_pack, k, n, nr))
            .report();
    }
}

fn check_packed_matches_naive() {
    let (m, k, n) = (37, 29, 53);
    let nr = VectorProfile::VLEN_128.packn(DType::Float32) * 2;
    let (a, b) = generate_test_matrices(m, n, k);
    let mut a_pack = vec![0.0f32; m * k];
    let mut b_pack = vec![0.0f32; k * n];
    reorder_kernel(&a, &mut a_pack, m, k);
    reorder_input(&b, &mut b_pack, k, n, nr);
    let mut c = vec![0.0f32; m * n];
    gemm_packed(&SerialPool, &mut c, &a_pack, &b_pack, None, m, k, n, nr);
    let expected = gemm_naive(&a, &b, None, m, k, n);
    let worst = c.iter().zip(&expected).map(|(x, y)| (x - y).abs()).fold(0.0f32, f32::max);
    println!("packed vs naive max abs diff: {:e}", worst);
}

fn main() {
    println!("====================================");
    println!("shl GEMM Benchmark Suite");
    println!("====================================");

    check_packed_matches_naive();
    benchmark_naive();
    benchmark_packed(1);
    benchmark_packed(4);
    benchmark_packing();

    println!("\n====================================");
    println!("Benchmark Complete");
    println!("====================================");
}
