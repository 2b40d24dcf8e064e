//! # Layer Utilities

/// Output size of a convolution or pooling window along one axis.
///
/// ``out = (size + 2 * padding - kernel) / stride + 1``
///
/// # Panics
///
/// If `stride` is zero, or the padded input is smaller than the kernel.
#[inline(always)]
pub fn conv_output_size(
    size: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> usize {
    assert!(stride > 0, "stride must be > 0");
    let padded = size + 2 * padding;
    assert!(
        padded >= kernel,
        "padded size {padded} is smaller than kernel {kernel}"
    );
    (padded - kernel) / stride + 1
}

/// Output resolution of a square window over ``[height, width]``.
#[inline(always)]
pub fn conv_output_resolution(
    input_resolution: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: usize,
) -> [usize; 2] {
    input_resolution.map(|size| conv_output_size(size, kernel, stride, padding))
}

/// Padding which preserves resolution at stride 1 for an odd kernel.
#[inline(always)]
pub fn same_padding(kernel: usize) -> usize {
    kernel / 2
}

/// Expand a scalar to a square ``[v, v]`` pair.
#[inline(always)]
pub fn scalar_to_array<const D: usize>(value: usize) -> [usize; D] {
    [value; D]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_output_size() {
        // 7x7/2 stem.
        assert_eq!(conv_output_size(96, 7, 2, 3), 48);
        // 3x3/2 maxpool.
        assert_eq!(conv_output_size(48, 3, 2, 1), 24);
        // 3x3/1 same conv.
        assert_eq!(conv_output_size(24, 3, 1, same_padding(3)), 24);
        // odd sizes round up under stride 2.
        assert_eq!(conv_output_size(25, 3, 2, 1), 13);
        // 1x1/2 projection.
        assert_eq!(conv_output_size(25, 1, 2, 0), 13);
    }

    #[test]
    fn test_conv_output_resolution() {
        assert_eq!(conv_output_resolution([96, 64], 7, 2, 3), [48, 32]);
        assert_eq!(scalar_to_array::<2>(3), [3, 3]);
    }

    #[test]
    #[should_panic(expected = "smaller than kernel")]
    fn test_conv_output_size_too_small() {
        conv_output_size(1, 7, 1, 0);
    }
}
