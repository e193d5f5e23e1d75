//! Windowed multi-scalar multiplication over the task queue.
//!
//! Scalars are partitioned into fixed-width bit windows; one task per window
//! pass invokes the instance's `MultiExpChunk` export and the partial sums
//! are folded Horner-style from the most significant pass down.
use crate::{
  codec,
  errors::EngineError,
  math::Math,
  pool::ThreadManager,
  start_span,
  task::{GroupId, GroupOp, Opcode, Param, Task},
  traits::{PoolEngine, PoolGroup},
};
use group::Group;
use std::time::Instant;
use tracing::{info, info_span};

/// Window widths indexed by ⌈log2(point count)⌉: more points widen the
/// window, trading bucket count against pass count.
const WINDOW_SIZES: [usize; 33] = [
  1, 1, 1, 1, 2, 3, 4, 5, 6, 7, 7, 8, 9, 10, 11, 12, 13, 13, 14, 15, 16, 16, 17, 17, 17, 17, 17,
  17, 17, 17, 17, 17, 17,
];

fn window_size(n_points: usize) -> usize {
  WINDOW_SIZES[n_points.log_2().min(32)]
}

/// Computes Σ scalarᵢ·baseᵢ. Bases are an affine sequence; scalars are
/// canonical little-endian integers of `n8s` bytes each. Counts beyond what
/// the buffer-length division implies are not diagnosed.
pub(crate) fn multi_exp<E, G>(
  tm: &mut ThreadManager<E>,
  id: GroupId,
  bases: &[u8],
  scalars: &[u8],
  n8s: usize,
) -> Result<Vec<u8>, EngineError>
where
  E: PoolEngine<Scalar = <G as Group>::Scalar>,
  G: PoolGroup,
{
  let sizes = tm.consts().group_sizes(id);
  if n8s == 0 || bases.len() % sizes.aff != 0 || scalars.len() % n8s != 0 {
    return Err(EngineError::InvalidInputLength);
  }
  let n_points = bases.len() / sizes.aff;
  if n_points == 0 {
    return codec::to_bytes(&G::identity()).map_err(EngineError::from);
  }
  let (_span, t) = start_span!("multi_exp", group = ?id, size = n_points);

  let width = window_size(n_points);
  let passes = (8 * n8s).div_ceil(width);
  let mut tasks = Vec::with_capacity(passes);
  for pass in 0..passes {
    let mut task = Task::new();
    let v_bases = task.alloc_set(bases.to_vec());
    let v_scalars = task.alloc_set(scalars.to_vec());
    let v_res = task.alloc(sizes.proj);
    task.call(
      Opcode::Group(id, GroupOp::MultiExpChunk),
      vec![
        Param::var(v_bases),
        Param::var(v_scalars),
        Param::Value(n8s as u64),
        Param::Value(n_points as u64),
        Param::Value((pass * width) as u64),
        Param::Value(width as u64),
        Param::var(v_res),
      ],
    );
    task.get(v_res, sizes.proj);
    tasks.push(task);
  }
  let results = tm.run_batch(tasks)?;

  // fold from the most significant pass down
  let mut acc = G::identity();
  for outs in results.iter().rev() {
    let partial: G = codec::from_bytes(outs.first().ok_or(EngineError::InternalError)?)?;
    for _ in 0..width {
      acc = acc.double();
    }
    acc += partial;
  }

  info!(elapsed_ms = %t.elapsed().as_millis(), size = n_points, "multi_exp");
  codec::to_bytes(&acc).map_err(EngineError::from)
}

/// One bit-window pass over all points: bucket accumulation followed by the
/// running-sum fold.
pub(crate) fn window_partial<G: PoolGroup>(
  bases: &[G::Affine],
  scalars: &[u8],
  n8s: usize,
  bit_off: usize,
  width: usize,
) -> G {
  let mut buckets = vec![G::identity(); (1 << width) - 1];
  for (i, base) in bases.iter().enumerate() {
    let d = get_window(&scalars[i * n8s..(i + 1) * n8s], bit_off, width);
    if d != 0 {
      buckets[d - 1] += *base;
    }
  }

  // Summation by parts:
  // e.g. 3a + 2b + 1c = a +
  //                    (a) + b +
  //                    ((a) + b) + c
  let mut running = G::identity();
  let mut res = G::identity();
  for b in buckets.into_iter().rev() {
    running += b;
    res += running;
  }
  res
}

/// Extracts `width` bits of a little-endian scalar starting at `bit_off`.
fn get_window(scalar: &[u8], bit_off: usize, width: usize) -> usize {
  let skip_bytes = bit_off / 8;
  if skip_bytes >= scalar.len() {
    return 0;
  }
  let mut buf = [0u8; 8];
  for (b, o) in buf.iter_mut().zip(scalar[skip_bytes..].iter()) {
    *b = *o;
  }
  let mut tmp = u64::from_le_bytes(buf);
  tmp >>= bit_off - skip_bytes * 8;
  (tmp & ((1 << width) - 1)) as usize
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::curve::{Concurrency, EngineConsts, PoolOpts};
  use crate::errors::TaskError;
  use crate::provider::Bn256Engine;
  use ff::{Field, PrimeField};
  use halo2curves::bn256::{Fr, G1};
  use halo2curves::group::Curve as _;
  use rand::{SeedableRng, rngs::StdRng};
  use std::sync::Arc;

  fn manager(concurrency: Concurrency) -> ThreadManager<Bn256Engine> {
    let consts = Arc::new(EngineConsts::<Bn256Engine>::new().unwrap());
    ThreadManager::new(
      PoolOpts {
        concurrency,
        arena_size: 1 << 20,
        local_fft_bits: 3,
      },
      consts,
    )
    .unwrap()
  }

  fn encode_affine(points: &[G1]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in points {
      out.extend(codec::to_bytes(&p.to_affine()).unwrap());
    }
    out
  }

  fn canonical(scalars: &[Fr]) -> Vec<u8> {
    scalars
      .iter()
      .flat_map(|s| s.to_repr().as_ref().to_vec())
      .collect()
  }

  #[test]
  fn matches_the_naive_sequential_sum() {
    let mut rng = StdRng::seed_from_u64(17);
    let n = 20;
    let bases: Vec<G1> = (0..n)
      .map(|_| G1::generator() * Fr::random(&mut rng))
      .collect();
    let scalars: Vec<Fr> = (0..n).map(|_| Fr::random(&mut rng)).collect();
    let n8s = Fr::ZERO.to_repr().as_ref().len();

    let expect = bases
      .iter()
      .zip(scalars.iter())
      .fold(G1::identity(), |acc, (b, s)| acc + *b * s);

    for concurrency in [Concurrency::Pool(2), Concurrency::Single] {
      let mut tm = manager(concurrency);
      let out = multi_exp::<Bn256Engine, G1>(
        &mut tm,
        GroupId::G1,
        &encode_affine(&bases),
        &canonical(&scalars),
        n8s,
      )
      .unwrap();
      let result: G1 = codec::from_bytes(&out).unwrap();
      assert_eq!(result.to_affine(), expect.to_affine());
    }
  }

  #[test]
  fn single_pair_equals_a_scalar_multiplication() {
    let mut tm = manager(Concurrency::Single);
    let base = G1::generator() * Fr::from(9u64);
    let scalar = Fr::from(123456789012345u64);
    let n8s = Fr::ZERO.to_repr().as_ref().len();
    let out = multi_exp::<Bn256Engine, G1>(
      &mut tm,
      GroupId::G1,
      &encode_affine(&[base]),
      &canonical(&[scalar]),
      n8s,
    )
    .unwrap();
    let result: G1 = codec::from_bytes(&out).unwrap();
    assert_eq!(result.to_affine(), (base * scalar).to_affine());
    // one task per one-bit window pass over the full scalar width
    assert_eq!(tm.dispatched(), 8 * n8s as u64);
  }

  #[test]
  fn short_scalars_shrink_the_pass_count() {
    let mut rng = StdRng::seed_from_u64(23);
    let n = 40;
    let bases: Vec<G1> = (0..n)
      .map(|_| G1::generator() * Fr::random(&mut rng))
      .collect();
    let raw: Vec<u64> = (0..n).map(|i| 3 * i as u64 + 1).collect();
    let scalars: Vec<u8> = raw.iter().flat_map(|v| v.to_le_bytes()).collect();

    let mut tm = manager(Concurrency::Pool(3));
    let out = multi_exp::<Bn256Engine, G1>(
      &mut tm,
      GroupId::G1,
      &encode_affine(&bases),
      &scalars,
      8,
    )
    .unwrap();
    let result: G1 = codec::from_bytes(&out).unwrap();
    let expect = bases
      .iter()
      .zip(raw.iter())
      .fold(G1::identity(), |acc, (b, v)| acc + *b * Fr::from(*v));
    assert_eq!(result.to_affine(), expect.to_affine());
  }

  #[test]
  fn zero_scalars_give_the_identity() {
    let mut tm = manager(Concurrency::Single);
    let bases: Vec<G1> = (1..=4).map(|i| G1::generator() * Fr::from(i as u64)).collect();
    let scalars = vec![0u8; 4 * 8];
    let out =
      multi_exp::<Bn256Engine, G1>(&mut tm, GroupId::G1, &encode_affine(&bases), &scalars, 8)
        .unwrap();
    let result: G1 = codec::from_bytes(&out).unwrap();
    assert!(bool::from(result.is_identity()));
  }

  #[test]
  fn empty_input_gives_the_identity_without_dispatch() {
    let mut tm = manager(Concurrency::Pool(2));
    let out = multi_exp::<Bn256Engine, G1>(&mut tm, GroupId::G1, &[], &[], 8).unwrap();
    let result: G1 = codec::from_bytes(&out).unwrap();
    assert!(bool::from(result.is_identity()));
    assert_eq!(tm.dispatched(), 0);
  }

  #[test]
  fn layout_mismatches_are_diagnosed() {
    let mut tm = manager(Concurrency::Single);
    let bases = encode_affine(&[G1::generator()]);
    // ragged scalar buffer
    assert!(matches!(
      multi_exp::<Bn256Engine, G1>(&mut tm, GroupId::G1, &bases, &[1, 2, 3], 8),
      Err(EngineError::InvalidInputLength)
    ));
    // fewer scalars than points surfaces as a structured worker error
    let two = encode_affine(&[G1::generator(), G1::generator()]);
    assert!(matches!(
      multi_exp::<Bn256Engine, G1>(&mut tm, GroupId::G1, &two, &[0u8; 8], 8),
      Err(EngineError::Task(TaskError::OutOfRange))
    ));
  }

  #[test]
  fn window_table_maps_a_single_point_to_width_one() {
    assert_eq!(window_size(1), 1);
    assert_eq!(window_size(2), 1);
    assert_eq!(window_size(16), 2);
    assert_eq!(window_size(1 << 16), 13);
    assert_eq!(window_size(usize::MAX), 17);
  }

  #[test]
  fn get_window_extracts_bits_across_byte_boundaries() {
    // 0b0000_0011_1100_0000 little-endian
    let scalar = [0b1100_0000u8, 0b0000_0011u8];
    assert_eq!(get_window(&scalar, 6, 4), 0b1111);
    assert_eq!(get_window(&scalar, 0, 6), 0);
    assert_eq!(get_window(&scalar, 8, 2), 0b11);
    assert_eq!(get_window(&scalar, 16, 4), 0);
    assert_eq!(get_window(&scalar, 100, 4), 0);
  }
}
