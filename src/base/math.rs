use crate::base::MEM_TRANSACTION_SIZE;

pub fn round_up_multiple(number: u64, multiple: u64) -> u64 {
    if number % multiple == 0 {
        number
    } else {
        number + multiple - number % multiple
    }
}

pub fn round_down_multiple(number: u64, multiple: u64) -> u64 {
    number - number % multiple
}

pub fn div_ceil(number: u64, divisor: u64) -> u64 {
    (number - 1) / divisor + 1
}

/// Advance a round-robin pointer. `usize::MAX` is the pre-start position.
pub fn inc_mod(number: usize, divisor: usize) -> usize {
    let next = number.wrapping_add(1);
    if next >= divisor {
        0
    } else {
        next
    }
}

pub fn log2_ceil(number: u64) -> u32 {
    let width = u64::BITS - number.leading_zeros();
    width - u32::from(number.is_power_of_two())
}

/// Smallest k with base^k >= number.
pub fn log_ceil(number: u64, base: u64) -> u32 {
    let mut result = 0;
    let mut aux = 1;
    while aux < number {
        aux *= base;
        result += 1;
    }
    result
}

/// Largest power of `base` that is <= `number`.
pub fn nearest_pow_floor(number: u64, base: u64) -> u64 {
    let mut result = 1;
    loop {
        let aux = result * base;
        if aux > number {
            break;
        }
        result = aux;
    }
    result
}

/// Relative comparison scaled by `c` machine epsilons.
pub fn almost_equal(a: f64, b: f64, c: f64) -> bool {
    (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()) * c
}

pub fn reqs_to_mb(reqs: usize) -> f64 {
    (reqs * MEM_TRANSACTION_SIZE) as f64 * 1e-6
}

/// Fraction of transferred bytes that carried no useful payload, in percent.
pub fn unused_bytes_ratio(reqs: usize, bytes: usize) -> f64 {
    let reqs_bytes = reqs * MEM_TRANSACTION_SIZE;
    (reqs_bytes.saturating_sub(bytes)) as f64 / reqs_bytes as f64 * 100.0
}

pub fn ratio(a: usize, b: usize) -> f64 {
    if b == 0 {
        return 0.0;
    }
    a as f64 / b as f64
}

pub fn fratio(a: f64, b: usize) -> f64 {
    if b == 0 {
        return 0.0;
    }
    a / b as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_up_multiple(0, 32), 0);
        assert_eq!(round_up_multiple(1, 32), 32);
        assert_eq!(round_up_multiple(32, 32), 32);
        assert_eq!(round_up_multiple(33, 96), 96);
        assert_eq!(round_down_multiple(95, 96), 0);
        assert_eq!(round_down_multiple(96, 96), 96);
    }

    #[test]
    fn division_and_logs() {
        assert_eq!(div_ceil(1, 4), 1);
        assert_eq!(div_ceil(4, 4), 1);
        assert_eq!(div_ceil(5, 4), 2);
        assert_eq!(log2_ceil(1), 0);
        assert_eq!(log2_ceil(8), 3);
        assert_eq!(log2_ceil(9), 4);
        assert_eq!(log_ceil(5, 4), 2);
        assert_eq!(log_ceil(16, 4), 2);
        assert_eq!(log_ceil(17, 4), 3);
        assert_eq!(nearest_pow_floor(5, 4), 4);
        assert_eq!(nearest_pow_floor(64, 4), 64);
        assert_eq!(nearest_pow_floor(3, 4), 1);
    }

    #[test]
    fn round_robin_pointer() {
        assert_eq!(inc_mod(usize::MAX, 4), 0);
        assert_eq!(inc_mod(0, 4), 1);
        assert_eq!(inc_mod(3, 4), 0);
    }

    #[test]
    fn float_comparison() {
        assert!(almost_equal(1.0, 1.0, 1.0));
        assert!(almost_equal(1.0, 1.0 + f64::EPSILON, 2.0));
        assert!(!almost_equal(1.0, 1.1, 1e6));
    }
}
