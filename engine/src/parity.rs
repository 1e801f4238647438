// Copyright 2026 Oxide Computer Company

/*
 * Parity and syndrome math over one-page blocks.
 *
 * P is plain XOR across the data blocks of a stripe.  Q is the RAID-6
 * syndrome over GF(2^8) with the conventional generator polynomial
 * 0x11d: Q = sum(g^i * D_i), where i is the block's position in
 * syndrome order (see StripeLayout::data_slots).  The same order must
 * be used for generation and recovery or Q is meaningless.
 *
 * Everything here is pure and panics on misuse: callers must never ask
 * for more erasures than the redundancy supports — that is an upstream
 * invariant violation, not an operational error.
 */

const GF_POLY: u32 = 0x11d;

const fn build_exp() -> [u8; 512] {
    let mut exp = [0u8; 512];
    let mut x: u32 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= GF_POLY;
        }
        i += 1;
    }
    // Doubled so exp[log a + log b] never needs a modulo.
    while i < 510 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    exp
}

const fn build_log(exp: &[u8; 512]) -> [u8; 256] {
    let mut log = [0u8; 256];
    let mut i = 0;
    while i < 255 {
        log[exp[i] as usize] = i as u8;
        i += 1;
    }
    log
}

const GF_EXP: [u8; 512] = build_exp();
const GF_LOG: [u8; 256] = build_log(&GF_EXP);

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        0
    } else {
        GF_EXP[GF_LOG[a as usize] as usize + GF_LOG[b as usize] as usize]
    }
}

/// g^p for arbitrary (possibly negative, expressed mod 255) exponents.
fn gf_pow(p: usize) -> u8 {
    GF_EXP[p % 255]
}

fn gf_inv(a: u8) -> u8 {
    assert_ne!(a, 0, "zero has no inverse");
    GF_EXP[255 - GF_LOG[a as usize] as usize]
}

/// acc ^= src, byte-wise.
pub(crate) fn xor_into(acc: &mut [u8], src: &[u8]) {
    assert_eq!(acc.len(), src.len());
    for (a, s) in acc.iter_mut().zip(src.iter()) {
        *a ^= *s;
    }
}

/// Multiply a block by a constant and xor into acc.
fn mul_xor_into(acc: &mut [u8], src: &[u8], c: u8) {
    assert_eq!(acc.len(), src.len());
    for (a, s) in acc.iter_mut().zip(src.iter()) {
        *a ^= gf_mul(*s, c);
    }
}

/// P = XOR of all data blocks (RAID-4/5, and the P half of RAID-6).
pub(crate) fn compute_parity(data: &[&[u8]], p: &mut [u8]) {
    assert!(!data.is_empty());
    p.fill(0);
    for d in data {
        xor_into(p, d);
    }
}

/// Generate both P and Q from data blocks in syndrome order.
pub(crate) fn compute_syndrome(data: &[&[u8]], p: &mut [u8], q: &mut [u8]) {
    assert!(!data.is_empty());
    p.fill(0);
    q.fill(0);
    // Horner: walking the blocks highest-index first folds one
    // multiply-by-g per step into the running sum.
    for d in data.iter().rev() {
        assert_eq!(d.len(), q.len());
        for (qb, db) in q.iter_mut().zip(d.iter()) {
            *qb = gf_mul(*qb, 2) ^ *db;
        }
        xor_into(p, d);
    }
}

/// Recover a single block as the XOR of everything else in the stripe
/// (the other data blocks plus P).  Works for any one missing data
/// block under RAID-5/6.
pub(crate) fn recover_xor(known: &[&[u8]], out: &mut [u8]) {
    assert!(!known.is_empty());
    out.fill(0);
    for k in known {
        xor_into(out, k);
    }
}

/**
 * RAID-6 recovery of one data block when P is also missing: Dx falls
 * out of Q alone, since Q' computed over the surviving data differs
 * from Q by exactly g^x * Dx.
 *
 * `data` is in syndrome order with `None` at the missing index `x`.
 */
pub(crate) fn recover_data_from_q(
    data: &[Option<&[u8]>],
    q: &[u8],
    x: usize,
    out: &mut [u8],
) {
    assert!(data[x].is_none());
    assert_eq!(data.iter().filter(|d| d.is_none()).count(), 1);

    out.fill(0);
    for (i, d) in data.iter().enumerate() {
        if let Some(d) = d {
            mul_xor_into(out, d, gf_pow(i));
        }
    }
    xor_into(out, q);
    // out now holds g^x * Dx
    let gx_inv = gf_inv(gf_pow(x));
    for b in out.iter_mut() {
        *b = gf_mul(*b, gx_inv);
    }
}

/**
 * RAID-6 dual-erasure recovery of two data blocks x < y from P and Q.
 *
 * With Pxy and Qxy the partial parity/syndrome over the surviving data:
 *   Dx = A * (P ^ Pxy) ^ B * (Q ^ Qxy)
 *   Dy = (P ^ Pxy) ^ Dx
 * where A = g^(y-x) / (g^(y-x) ^ 1) and B = g^(-x) / (g^(y-x) ^ 1).
 */
pub(crate) fn recover_two_data(
    data: &[Option<&[u8]>],
    p: &[u8],
    q: &[u8],
    x: usize,
    y: usize,
    out_x: &mut [u8],
    out_y: &mut [u8],
) {
    assert!(x < y, "erased indices must be distinct and ordered");
    assert!(data[x].is_none() && data[y].is_none());
    assert_eq!(data.iter().filter(|d| d.is_none()).count(), 2);

    let len = p.len();
    let mut pxy = vec![0u8; len];
    let mut qxy = vec![0u8; len];
    for (i, d) in data.iter().enumerate() {
        if let Some(d) = d {
            xor_into(&mut pxy, d);
            mul_xor_into(&mut qxy, d, gf_pow(i));
        }
    }
    xor_into(&mut pxy, p);
    xor_into(&mut qxy, q);

    let denom = gf_inv(gf_pow(y - x) ^ 1);
    let a = gf_mul(gf_pow(y - x), denom);
    let b = gf_mul(gf_pow(255 - (x % 255)), denom);

    for i in 0..len {
        out_x[i] = gf_mul(pxy[i], a) ^ gf_mul(qxy[i], b);
        out_y[i] = pxy[i] ^ out_x[i];
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    const LEN: usize = 4096;

    fn blocks(n: usize, seed: u64) -> Vec<Vec<u8>> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..LEN).map(|_| rng.gen()).collect())
            .collect()
    }

    fn refs(v: &[Vec<u8>]) -> Vec<&[u8]> {
        v.iter().map(|b| b.as_slice()).collect()
    }

    #[test]
    fn test_gf_field_axioms() {
        // Exhaustive: a * inv(a) == 1, a * 1 == a.
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1, "a={}", a);
            assert_eq!(gf_mul(a, 1), a);
        }
        // Spot-check distributivity on a sample.
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..1000 {
            let (a, b, c): (u8, u8, u8) = rng.gen();
            assert_eq!(
                gf_mul(a, b ^ c),
                gf_mul(a, b) ^ gf_mul(a, c),
                "a={} b={} c={}",
                a,
                b,
                c
            );
        }
    }

    #[test]
    fn test_parity_round_trip() {
        // XOR of all data blocks plus P is zero.
        let data = blocks(5, 1);
        let mut p = vec![0u8; LEN];
        compute_parity(&refs(&data), &mut p);

        let mut acc = p.clone();
        for d in &data {
            xor_into(&mut acc, d);
        }
        assert!(acc.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_syndrome_p_matches_parity() {
        let data = blocks(6, 2);
        let mut p1 = vec![0u8; LEN];
        let mut p2 = vec![0u8; LEN];
        let mut q = vec![0u8; LEN];
        compute_parity(&refs(&data), &mut p1);
        compute_syndrome(&refs(&data), &mut p2, &mut q);
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_syndrome_order_matters() {
        let mut data = blocks(4, 3);
        let mut p = vec![0u8; LEN];
        let mut q1 = vec![0u8; LEN];
        let mut q2 = vec![0u8; LEN];
        compute_syndrome(&refs(&data), &mut p, &mut q1);
        data.swap(0, 2);
        compute_syndrome(&refs(&data), &mut p, &mut q2);
        assert_ne!(q1, q2);
    }

    #[test]
    fn test_single_erasure_via_xor() {
        for n in 2..=6 {
            let data = blocks(n, n as u64);
            let mut p = vec![0u8; LEN];
            compute_parity(&refs(&data), &mut p);

            for missing in 0..n {
                let mut known: Vec<&[u8]> = Vec::new();
                for (i, d) in data.iter().enumerate() {
                    if i != missing {
                        known.push(d);
                    }
                }
                known.push(&p);
                let mut out = vec![0u8; LEN];
                recover_xor(&known, &mut out);
                assert_eq!(out, data[missing], "n={} missing={}", n, missing);
            }
        }
    }

    #[test]
    fn test_data_plus_p_erasure() {
        // Lose one data block and P: data comes back from Q alone.
        for n in 2..=6 {
            let data = blocks(n, 100 + n as u64);
            let mut p = vec![0u8; LEN];
            let mut q = vec![0u8; LEN];
            compute_syndrome(&refs(&data), &mut p, &mut q);

            for missing in 0..n {
                let opt: Vec<Option<&[u8]>> = data
                    .iter()
                    .enumerate()
                    .map(|(i, d)| {
                        if i == missing {
                            None
                        } else {
                            Some(d.as_slice())
                        }
                    })
                    .collect();
                let mut out = vec![0u8; LEN];
                recover_data_from_q(&opt, &q, missing, &mut out);
                assert_eq!(out, data[missing], "n={} missing={}", n, missing);
            }
        }
    }

    #[test]
    fn test_dual_data_erasure_all_pairs() {
        for n in 3..=7 {
            let data = blocks(n, 200 + n as u64);
            let mut p = vec![0u8; LEN];
            let mut q = vec![0u8; LEN];
            compute_syndrome(&refs(&data), &mut p, &mut q);

            for x in 0..n {
                for y in (x + 1)..n {
                    let opt: Vec<Option<&[u8]>> = data
                        .iter()
                        .enumerate()
                        .map(|(i, d)| {
                            if i == x || i == y {
                                None
                            } else {
                                Some(d.as_slice())
                            }
                        })
                        .collect();
                    let mut out_x = vec![0u8; LEN];
                    let mut out_y = vec![0u8; LEN];
                    recover_two_data(
                        &opt, &p, &q, x, y, &mut out_x, &mut out_y,
                    );
                    assert_eq!(out_x, data[x], "n={} x={} y={}", n, x, y);
                    assert_eq!(out_y, data[y], "n={} x={} y={}", n, x, y);
                }
            }
        }
    }

    #[test]
    #[should_panic]
    fn test_two_erasure_rejects_same_index() {
        let data = blocks(4, 9);
        let opt: Vec<Option<&[u8]>> =
            data.iter().map(|d| Some(d.as_slice())).collect();
        let p = vec![0u8; LEN];
        let q = vec![0u8; LEN];
        let mut a = vec![0u8; LEN];
        let mut b = vec![0u8; LEN];
        recover_two_data(&opt, &p, &q, 2, 2, &mut a, &mut b);
    }

    #[test]
    #[should_panic]
    fn test_two_erasure_rejects_extra_missing() {
        let data = blocks(5, 10);
        let opt: Vec<Option<&[u8]>> = data
            .iter()
            .enumerate()
            .map(|(i, d)| if i < 3 { None } else { Some(d.as_slice()) })
            .collect();
        let p = vec![0u8; LEN];
        let q = vec![0u8; LEN];
        let mut a = vec![0u8; LEN];
        let mut b = vec![0u8; LEN];
        recover_two_data(&opt, &p, &q, 0, 1, &mut a, &mut b);
    }
}
