//! Shape arithmetic shared by the spatial modules.

/// Advances a multi-dimensional counter over `bounds` in row-major order.
///
/// Returns `false` once the counter wraps around to all zeros.
pub(crate) fn next_index(index: &mut [usize], bounds: &[usize]) -> bool {
    for axis in (0..index.len()).rev() {
        index[axis] += 1;
        if index[axis] < bounds[axis] {
            return true;
        }
        index[axis] = 0;
    }
    false
}

/// The output extent of a window of size `window` slid over an axis of size
/// `input`.
pub(crate) fn sliding_out_dim(
    input: usize,
    window: usize,
    padding: usize,
    dilation: usize,
    stride: usize,
) -> usize {
    let effective_window = dilation * (window - 1) + 1;
    assert!(
        input + 2 * padding >= effective_window,
        "error: window of size {} does not fit in an axis of size {} with padding {}.",
        effective_window,
        input,
        padding
    );
    (input + 2 * padding - effective_window) / stride + 1
}

#[cfg(test)]
mod test {
    use super::{next_index, sliding_out_dim};

    #[test]
    fn row_major_iteration() {
        let mut index = vec![0, 0];
        let mut visited = vec![index.clone()];
        while next_index(&mut index, &[2, 3]) {
            visited.push(index.clone());
        }

        assert_eq!(
            visited,
            [[0, 0], [0, 1], [0, 2], [1, 0], [1, 1], [1, 2]]
        );
    }

    #[test]
    fn window_arithmetic() {
        assert_eq!(sliding_out_dim(4, 2, 0, 1, 2), 2);
        assert_eq!(sliding_out_dim(10, 3, 0, 1, 1), 8);
        assert_eq!(sliding_out_dim(10, 3, 1, 1, 1), 10);
        assert_eq!(sliding_out_dim(8, 3, 1, 2, 2), 3);
    }

    #[test]
    #[should_panic]
    fn oversized_window() {
        sliding_out_dim(3, 4, 0, 1, 1);
    }
}
