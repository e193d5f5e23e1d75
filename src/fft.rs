//! FFT/IFFT over curve-group elements, dispatched through the task queue.
//!
//! Curve scalar multiplication stands in for field multiplication and point
//! addition/subtraction for field addition/subtraction inside the butterfly;
//! twiddle factors are the precomputed scalar-field roots of unity. Small
//! transforms run as one task; large ones are bit-reverse permuted, split
//! into chunks for local butterfly stages, and merged across chunks level by
//! level. Both directions run the forward-root pipeline: the inverse is
//! realized by the final 1/n scale plus the negative-index wraparound
//! `out[(n−k) mod n] = y[k]`, so the twiddle tables are shared.
use crate::{
  codec,
  errors::{EngineError, TaskError},
  math::{Math, bit_reverse},
  pool::ThreadManager,
  start_span,
  task::{GroupId, GroupOp, Opcode, Param, Task},
  traits::{PoolEngine, PoolGroup},
};
use ff::Field;
use itertools::izip;
use std::time::Instant;
use tracing::{info, info_span};

/// Iterative butterfly stages over data already in bit-reversed order.
/// `roots[i]` must be a primitive `2^i`-th root of unity.
pub(crate) fn butterflies<G: PoolGroup>(
  a: &mut [G],
  roots: &[G::Scalar],
) -> Result<(), TaskError> {
  let n = a.len();
  if n <= 1 {
    return Ok(());
  }
  if !n.is_power_of_two() {
    return Err(TaskError::BadLayout);
  }
  let log_n = n.log_2();
  if log_n >= roots.len() {
    return Err(TaskError::BadParams("transform exceeds two-adicity"));
  }
  for level in 1..=log_n {
    let w_m = roots[level];
    let m = 1 << (level - 1);
    let mut k = 0;
    while k < n {
      let mut w = G::Scalar::ONE;
      for j in 0..m {
        let t = a[k + j + m] * w;
        let u = a[k + j];
        a[k + j] = u + t;
        a[k + j + m] = u - t;
        w *= w_m;
      }
      k += 2 * m;
    }
  }
  Ok(())
}

/// In-place bit-reversal permutation of a power-of-two-length sequence.
pub(crate) fn permute_bit_reverse<T>(a: &mut [T]) -> Result<(), TaskError> {
  let n = a.len();
  if n <= 1 {
    return Ok(());
  }
  if !n.is_power_of_two() {
    return Err(TaskError::BadLayout);
  }
  let bits = n.log_2() as u32;
  for k in 0..n {
    let rk = bit_reverse(k, bits);
    if k < rk {
      a.swap(k, rk);
    }
  }
  Ok(())
}

/// One cross-chunk butterfly merge: multiplies `b` by the running twiddle
/// starting at `first` with increment `inc`, then combines by add/subtract.
pub(crate) fn join_pair<G: PoolGroup>(a: &mut [G], b: &mut [G], first: G::Scalar, inc: G::Scalar) {
  let mut w = first;
  for j in 0..a.len().min(b.len()) {
    let t = b[j] * w;
    b[j] = a[j] - t;
    a[j] += t;
    w *= inc;
  }
}

/// Elementwise scalar multiplication by a fixed factor.
pub(crate) fn scale<G: PoolGroup>(a: &mut [G], factor: G::Scalar) {
  for p in a.iter_mut() {
    *p = *p * factor;
  }
}

/// Forward or inverse transform of an affine element sequence.
pub(crate) fn fft<E: PoolEngine>(
  tm: &mut ThreadManager<E>,
  id: GroupId,
  buff: &[u8],
  inverse: bool,
) -> Result<Vec<u8>, EngineError> {
  let sizes = tm.consts().group_sizes(id);
  let el = sizes.aff;
  if buff.is_empty() || buff.len() % el != 0 {
    return Err(EngineError::InvalidInputLength);
  }
  let n = buff.len() / el;
  if !n.is_power_of_two() {
    return Err(EngineError::NotPowerOfTwo);
  }
  if n == 1 {
    return Ok(buff.to_vec());
  }
  let log_n = n.log_2();
  if log_n > tm.consts().two_adicity() {
    return Err(EngineError::DomainTooLarge(log_n));
  }
  let (_span, t) = start_span!("fft", group = ?id, size = n, inverse);
  let local_bits = tm.opts().local_fft_bits.max(1);
  let out = if log_n <= local_bits {
    fft_single(tm, id, buff, n, inverse)?
  } else {
    fft_chunked(tm, id, buff, n, inverse, local_bits)?
  };
  info!(elapsed_ms = %t.elapsed().as_millis(), size = n, inverse, "fft");
  Ok(out)
}

/// Whole transform as one task: convert to projective, run the transform
/// export, convert back.
fn fft_single<E: PoolEngine>(
  tm: &mut ThreadManager<E>,
  id: GroupId,
  buff: &[u8],
  n: usize,
  inverse: bool,
) -> Result<Vec<u8>, EngineError> {
  let sizes = tm.consts().group_sizes(id);
  let mut task = Task::new();
  let v_in = task.alloc_set(buff.to_vec());
  let v_work = task.alloc(n * sizes.proj);
  task.call(
    Opcode::Group(id, GroupOp::BatchToProjective),
    vec![Param::var(v_in), Param::var(v_work), Param::Value(n as u64)],
  );
  task.call(
    Opcode::Group(id, GroupOp::Fft),
    vec![
      Param::var(v_work),
      Param::Value(n as u64),
      Param::Value(u64::from(inverse)),
    ],
  );
  let v_out = task.alloc(n * sizes.aff);
  task.call(
    Opcode::Group(id, GroupOp::BatchToAffine),
    vec![Param::var(v_work), Param::var(v_out), Param::Value(n as u64)],
  );
  task.get(v_out, n * sizes.aff);
  first_output(tm.run_batch(vec![task])?)
}

/// Chunked multi-pass transform: bit-reverse, local stages per chunk, then
/// cross-chunk merge levels; the final level also applies the inverse scale
/// factor and the conversion back to affine.
fn fft_chunked<E: PoolEngine>(
  tm: &mut ThreadManager<E>,
  id: GroupId,
  buff: &[u8],
  n: usize,
  inverse: bool,
  local_bits: usize,
) -> Result<Vec<u8>, EngineError> {
  let sizes = tm.consts().group_sizes(id);
  let el = sizes.aff;
  let log_n = n.log_2();
  let m = 1usize << local_bits; // elements per chunk
  let n_chunks = n / m;

  // 1. bit-reverse permutation of the whole sequence
  let mut data = buff.to_vec();
  let bits = log_n as u32;
  for k in 0..n {
    let rk = bit_reverse(k, bits);
    if k < rk {
      for byte in 0..el {
        data.swap(k * el + byte, rk * el + byte);
      }
    }
  }

  // 2. local butterfly stages, one task per chunk
  let mut tasks = Vec::with_capacity(n_chunks);
  for c in 0..n_chunks {
    let mut task = Task::new();
    let v_in = task.alloc_set(data[c * m * el..(c + 1) * m * el].to_vec());
    let v_work = task.alloc(m * sizes.proj);
    task.call(
      Opcode::Group(id, GroupOp::BatchToProjective),
      vec![Param::var(v_in), Param::var(v_work), Param::Value(m as u64)],
    );
    task.call(
      Opcode::Group(id, GroupOp::FftMix),
      vec![Param::var(v_work), Param::Value(m as u64)],
    );
    task.get(v_work, m * sizes.proj);
    tasks.push(task);
  }
  let mut chunks = tm
    .run_batch(tasks)?
    .into_iter()
    .map(|outs| outs.into_iter().next().ok_or(EngineError::InternalError))
    .collect::<Result<Vec<_>, _>>()?;

  let inv_n = if inverse {
    let f = Option::<E::Scalar>::from(E::Scalar::from(n as u64).invert())
      .ok_or(EngineError::InternalError)?;
    Some(codec::to_bytes(&f)?)
  } else {
    None
  };

  // 3. cross-chunk merge levels; chunks at distance half the group size pair
  //    up with twiddle first = root^(q·m), increment root
  for level in (local_bits + 1)..=log_n {
    let root = tm.consts().root(level)?;
    let root_bytes = codec::to_bytes(&root)?;
    let group_chunks = 1usize << (level - local_bits);
    let half = group_chunks / 2;
    let last = level == log_n;
    let mut jobs = Vec::new();
    let mut tasks = Vec::new();
    for g in 0..(n_chunks / group_chunks) {
      for q in 0..half {
        let ia = g * group_chunks + q;
        let ib = ia + half;
        let first = root.pow_vartime([(q * m) as u64]);
        let mut task = Task::new();
        let v_a = task.alloc_set(chunks[ia].clone());
        let v_b = task.alloc_set(chunks[ib].clone());
        let v_first = task.alloc_set(codec::to_bytes(&first)?);
        let v_inc = task.alloc_set(root_bytes.clone());
        task.call(
          Opcode::Group(id, GroupOp::FftJoin),
          vec![
            Param::var(v_a),
            Param::var(v_b),
            Param::Value(m as u64),
            Param::var(v_first),
            Param::var(v_inc),
          ],
        );
        if last {
          if let Some(factor) = &inv_n {
            let v_factor = task.alloc_set(factor.clone());
            for v in [v_a, v_b] {
              task.call(
                Opcode::Group(id, GroupOp::FftFinal),
                vec![Param::var(v), Param::Value(m as u64), Param::var(v_factor)],
              );
            }
          }
          for v in [v_a, v_b] {
            let v_out = task.alloc(m * sizes.aff);
            task.call(
              Opcode::Group(id, GroupOp::BatchToAffine),
              vec![Param::var(v), Param::var(v_out), Param::Value(m as u64)],
            );
            task.get(v_out, m * sizes.aff);
          }
        } else {
          task.get(v_a, m * sizes.proj);
          task.get(v_b, m * sizes.proj);
        }
        jobs.push((ia, ib));
        tasks.push(task);
      }
    }
    let results = tm.run_batch(tasks)?;
    for ((ia, ib), outs) in izip!(jobs, results) {
      let mut outs = outs.into_iter();
      chunks[ia] = outs.next().ok_or(EngineError::InternalError)?;
      chunks[ib] = outs.next().ok_or(EngineError::InternalError)?;
    }
  }

  // 4. reassembly: in order for the forward transform; the inverse applies
  //    the negative-index wraparound, so the tail of the sequence lands in
  //    reverse with element 0 fixed
  let flat = chunks.concat();
  if !inverse {
    return Ok(flat);
  }
  let mut out = vec![0u8; n * el];
  out[..el].copy_from_slice(&flat[..el]);
  for k in 1..n {
    let dst = (n - k) * el;
    out[dst..dst + el].copy_from_slice(&flat[k * el..(k + 1) * el]);
  }
  Ok(out)
}

/// Local butterfly stages over equal chunks of an affine sequence, exposed so
/// a caller can interleave extra per-element work between transform stages.
pub(crate) fn fft_mix<E: PoolEngine>(
  tm: &mut ThreadManager<E>,
  id: GroupId,
  buff: &[u8],
) -> Result<Vec<u8>, EngineError> {
  let sizes = tm.consts().group_sizes(id);
  let el = sizes.aff;
  if buff.is_empty() || buff.len() % el != 0 {
    return Err(EngineError::InvalidInputLength);
  }
  let n = buff.len() / el;
  if !n.is_power_of_two() {
    return Err(EngineError::NotPowerOfTwo);
  }
  let m = n.min(1 << tm.opts().local_fft_bits.max(1));
  let mut tasks = Vec::with_capacity(n / m);
  for c in 0..(n / m) {
    let mut task = Task::new();
    let v_in = task.alloc_set(buff[c * m * el..(c + 1) * m * el].to_vec());
    let v_work = task.alloc(m * sizes.proj);
    task.call(
      Opcode::Group(id, GroupOp::BatchToProjective),
      vec![Param::var(v_in), Param::var(v_work), Param::Value(m as u64)],
    );
    task.call(
      Opcode::Group(id, GroupOp::FftMix),
      vec![Param::var(v_work), Param::Value(m as u64)],
    );
    task.call(
      Opcode::Group(id, GroupOp::BatchToAffine),
      vec![Param::var(v_work), Param::var(v_in), Param::Value(m as u64)],
    );
    task.get(v_in, m * sizes.aff);
    tasks.push(task);
  }
  collect_chunks(tm.run_batch(tasks)?)
}

/// Joins two equal-length affine sequences with a running twiddle that starts
/// at `first` (internal form) and advances by `inc` per element.
pub(crate) fn fft_join<E: PoolEngine>(
  tm: &mut ThreadManager<E>,
  id: GroupId,
  buff_a: &[u8],
  buff_b: &[u8],
  first: &[u8],
  inc: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), EngineError> {
  let sizes = tm.consts().group_sizes(id);
  let el = sizes.aff;
  if buff_a.len() != buff_b.len() || buff_a.is_empty() || buff_a.len() % el != 0 {
    return Err(EngineError::InvalidInputLength);
  }
  let first: E::Scalar = codec::from_bytes(first)?;
  let inc: E::Scalar = codec::from_bytes(inc)?;
  let n = buff_a.len() / el;
  let m = n.min(1 << tm.opts().local_fft_bits.max(1));
  let inc_bytes = codec::to_bytes(&inc)?;
  let mut tasks = Vec::new();
  let mut offset = 0usize;
  while offset < n {
    let len = m.min(n - offset);
    let chunk_first = first * inc.pow_vartime([offset as u64]);
    let mut task = Task::new();
    let v_a = task.alloc_set(buff_a[offset * el..(offset + len) * el].to_vec());
    let v_b = task.alloc_set(buff_b[offset * el..(offset + len) * el].to_vec());
    let v_wa = task.alloc(len * sizes.proj);
    let v_wb = task.alloc(len * sizes.proj);
    for (src, dst) in [(v_a, v_wa), (v_b, v_wb)] {
      task.call(
        Opcode::Group(id, GroupOp::BatchToProjective),
        vec![Param::var(src), Param::var(dst), Param::Value(len as u64)],
      );
    }
    let v_first = task.alloc_set(codec::to_bytes(&chunk_first)?);
    let v_inc = task.alloc_set(inc_bytes.clone());
    task.call(
      Opcode::Group(id, GroupOp::FftJoin),
      vec![
        Param::var(v_wa),
        Param::var(v_wb),
        Param::Value(len as u64),
        Param::var(v_first),
        Param::var(v_inc),
      ],
    );
    for (src, dst) in [(v_wa, v_a), (v_wb, v_b)] {
      task.call(
        Opcode::Group(id, GroupOp::BatchToAffine),
        vec![Param::var(src), Param::var(dst), Param::Value(len as u64)],
      );
      task.get(dst, len * sizes.aff);
    }
    tasks.push(task);
    offset += len;
  }
  let results = tm.run_batch(tasks)?;
  let mut out_a = Vec::with_capacity(buff_a.len());
  let mut out_b = Vec::with_capacity(buff_b.len());
  for outs in results {
    let mut outs = outs.into_iter();
    out_a.extend(outs.next().ok_or(EngineError::InternalError)?);
    out_b.extend(outs.next().ok_or(EngineError::InternalError)?);
  }
  Ok((out_a, out_b))
}

/// Multiplies every element of an affine sequence by a fixed scalar factor
/// (internal form); the closing step of an interleaved transform.
pub(crate) fn fft_final<E: PoolEngine>(
  tm: &mut ThreadManager<E>,
  id: GroupId,
  buff: &[u8],
  factor: &[u8],
) -> Result<Vec<u8>, EngineError> {
  let sizes = tm.consts().group_sizes(id);
  let el = sizes.aff;
  if buff.is_empty() || buff.len() % el != 0 {
    return Err(EngineError::InvalidInputLength);
  }
  let factor: E::Scalar = codec::from_bytes(factor)?;
  let factor_bytes = codec::to_bytes(&factor)?;
  let n = buff.len() / el;
  let m = n.min(1 << tm.opts().local_fft_bits.max(1));
  let mut tasks = Vec::new();
  let mut offset = 0usize;
  while offset < n {
    let len = m.min(n - offset);
    let mut task = Task::new();
    let v_in = task.alloc_set(buff[offset * el..(offset + len) * el].to_vec());
    let v_work = task.alloc(len * sizes.proj);
    task.call(
      Opcode::Group(id, GroupOp::BatchToProjective),
      vec![Param::var(v_in), Param::var(v_work), Param::Value(len as u64)],
    );
    let v_factor = task.alloc_set(factor_bytes.clone());
    task.call(
      Opcode::Group(id, GroupOp::FftFinal),
      vec![Param::var(v_work), Param::Value(len as u64), Param::var(v_factor)],
    );
    task.call(
      Opcode::Group(id, GroupOp::BatchToAffine),
      vec![Param::var(v_work), Param::var(v_in), Param::Value(len as u64)],
    );
    task.get(v_in, len * sizes.aff);
    tasks.push(task);
    offset += len;
  }
  collect_chunks(tm.run_batch(tasks)?)
}

fn first_output(results: Vec<Vec<Vec<u8>>>) -> Result<Vec<u8>, EngineError> {
  results
    .into_iter()
    .next()
    .and_then(|outs| outs.into_iter().next())
    .ok_or(EngineError::InternalError)
}

fn collect_chunks(results: Vec<Vec<Vec<u8>>>) -> Result<Vec<u8>, EngineError> {
  let mut out = Vec::new();
  for outs in results {
    out.extend(outs.into_iter().next().ok_or(EngineError::InternalError)?);
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::curve::{Concurrency, EngineConsts, PoolOpts};
  use crate::provider::Bn256Engine;
  use halo2curves::bn256::{Fr, G1, G1Affine};
  use halo2curves::group::{Curve as _, Group, cofactor::CofactorCurveAffine};
  use rand::{Rng, SeedableRng, rngs::StdRng};
  use std::sync::Arc;

  fn manager(concurrency: Concurrency, local_fft_bits: usize) -> ThreadManager<Bn256Engine> {
    let consts = Arc::new(EngineConsts::<Bn256Engine>::new().unwrap());
    ThreadManager::new(
      PoolOpts {
        concurrency,
        arena_size: 1 << 20,
        local_fft_bits,
      },
      consts,
    )
    .unwrap()
  }

  fn points(n: usize, seed: u64) -> Vec<G1> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
      .map(|_| G1::generator() * Fr::from(rng.r#gen::<u64>()))
      .collect()
  }

  fn encode_affine(points: &[G1]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in points {
      out.extend(codec::to_bytes(&p.to_affine()).unwrap());
    }
    out
  }

  fn decode_affine(buff: &[u8]) -> Vec<G1Affine> {
    let el = codec::byte_len(&G1Affine::identity()).unwrap();
    buff
      .chunks(el)
      .map(|c| codec::from_bytes(c).unwrap())
      .collect()
  }

  fn naive_dft(input: &[G1], root: Fr) -> Vec<G1> {
    let n = input.len();
    (0..n)
      .map(|k| {
        let mut acc = G1::identity();
        for (j, p) in input.iter().enumerate() {
          acc += *p * root.pow_vartime([(j * k % n) as u64]);
        }
        acc
      })
      .collect()
  }

  #[test]
  fn forward_transform_matches_naive_dft() {
    let mut tm = manager(Concurrency::Single, 10);
    let input = points(8, 1);
    let root = tm.consts().root(3).unwrap();
    let out = fft(&mut tm, GroupId::G1, &encode_affine(&input), false).unwrap();
    let expect: Vec<G1Affine> = naive_dft(&input, root)
      .iter()
      .map(|p| p.to_affine())
      .collect();
    assert_eq!(decode_affine(&out), expect);
  }

  #[test]
  fn inverse_transform_round_trips() {
    let mut tm = manager(Concurrency::Single, 10);
    for n in [2usize, 4, 8, 16] {
      let buff = encode_affine(&points(n, n as u64));
      let evals = fft(&mut tm, GroupId::G1, &buff, false).unwrap();
      let back = fft(&mut tm, GroupId::G1, &evals, true).unwrap();
      assert_eq!(back, buff);
    }
  }

  #[test]
  fn chunked_path_matches_single_task_path() {
    let buff = encode_affine(&points(32, 7));
    let mut single = manager(Concurrency::Single, 10);
    let mut chunked = manager(Concurrency::Pool(3), 2);
    for inverse in [false, true] {
      let a = fft(&mut single, GroupId::G1, &buff, inverse).unwrap();
      let b = fft(&mut chunked, GroupId::G1, &buff, inverse).unwrap();
      assert_eq!(a, b);
    }
    // the chunked pipeline agrees across concurrency modes as well
    let mut chunked_inline = manager(Concurrency::Single, 2);
    assert_eq!(
      fft(&mut chunked_inline, GroupId::G1, &buff, false).unwrap(),
      fft(&mut chunked, GroupId::G1, &buff, false).unwrap()
    );
  }

  #[test]
  fn length_one_input_returns_unchanged_with_zero_dispatch() {
    let mut tm = manager(Concurrency::Pool(2), 10);
    let buff = encode_affine(&points(1, 3));
    assert_eq!(fft(&mut tm, GroupId::G1, &buff, false).unwrap(), buff);
    assert_eq!(fft(&mut tm, GroupId::G1, &buff, true).unwrap(), buff);
    assert_eq!(tm.dispatched(), 0);
  }

  #[test]
  fn non_power_of_two_is_rejected_before_dispatch() {
    let mut tm = manager(Concurrency::Pool(2), 10);
    let buff = encode_affine(&points(3, 3));
    assert!(matches!(
      fft(&mut tm, GroupId::G1, &buff, false),
      Err(EngineError::NotPowerOfTwo)
    ));
    assert!(matches!(
      fft(&mut tm, GroupId::G1, &buff[..buff.len() - 1], false),
      Err(EngineError::InvalidInputLength)
    ));
    assert_eq!(tm.dispatched(), 0);
  }

  #[test]
  fn fft_final_scales_every_element() {
    let mut tm = manager(Concurrency::Single, 2);
    // arbitrary length, not a power of two
    let input = points(6, 9);
    let factor = Fr::from(5u64);
    let out = fft_final(
      &mut tm,
      GroupId::G1,
      &encode_affine(&input),
      &codec::to_bytes(&factor).unwrap(),
    )
    .unwrap();
    let expect: Vec<G1Affine> = input.iter().map(|p| (*p * factor).to_affine()).collect();
    assert_eq!(decode_affine(&out), expect);
  }

  #[test]
  fn fft_join_applies_a_running_twiddle() {
    // chunks of two exercise the per-chunk twiddle offset
    let mut tm = manager(Concurrency::Single, 1);
    let a = points(4, 11);
    let b = points(4, 12);
    let first = Fr::from(3u64);
    let inc = Fr::from(7u64);
    let (oa, ob) = fft_join(
      &mut tm,
      GroupId::G1,
      &encode_affine(&a),
      &encode_affine(&b),
      &codec::to_bytes(&first).unwrap(),
      &codec::to_bytes(&inc).unwrap(),
    )
    .unwrap();
    let mut w = first;
    let mut ea = Vec::new();
    let mut eb = Vec::new();
    for j in 0..4 {
      let t = b[j] * w;
      ea.push((a[j] + t).to_affine());
      eb.push((a[j] - t).to_affine());
      w *= inc;
    }
    assert_eq!(decode_affine(&oa), ea);
    assert_eq!(decode_affine(&ob), eb);
  }

  #[test]
  fn fft_mix_runs_the_local_butterflies() {
    let mut tm = manager(Concurrency::Single, 1);
    let input = points(4, 13);
    let out = fft_mix(&mut tm, GroupId::G1, &encode_affine(&input)).unwrap();
    let expect: Vec<G1Affine> = vec![
      (input[0] + input[1]).to_affine(),
      (input[0] - input[1]).to_affine(),
      (input[2] + input[3]).to_affine(),
      (input[2] - input[3]).to_affine(),
    ];
    assert_eq!(decode_affine(&out), expect);
  }
}
