//! Western Electric style run detection
//!
//! Both functions look backwards from the last value and count points in
//! the run that ends there, the last value included.

/// Side of the center line: `1` above, `-1` below, `0` on it.
fn side(value: f64, center: f64) -> i8 {
    if value > center {
        1
    } else if value < center {
        -1
    } else {
        0
    }
}

/// Length of the run of points strictly on the same side of `center`.
pub fn same_side_run(values: &[f64], center: f64) -> usize {
    let Some(&last) = values.last() else {
        return 0;
    };
    let s = side(last, center);
    if s == 0 {
        return 0;
    }
    values.iter().rev().take_while(|&&v| side(v, center) == s).count()
}

/// Length of the run of strictly increasing or strictly decreasing points,
/// all strictly on one side of `center`.
pub fn monotonic_run(values: &[f64], center: f64) -> usize {
    let Some(&last) = values.last() else {
        return 0;
    };
    let s = side(last, center);
    if s == 0 {
        return 0;
    }

    let mut len = 1;
    let mut direction: Option<bool> = None;
    for pair in values.windows(2).rev() {
        let (prev, next) = (pair[0], pair[1]);
        if side(prev, center) != s || prev == next {
            break;
        }
        let rising = next > prev;
        match direction {
            None => direction = Some(rising),
            Some(d) if d != rising => break,
            Some(_) => {}
        }
        len += 1;
    }
    len
}
