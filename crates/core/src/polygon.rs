//! Mask thresholding and contour extraction for `segment_compute_polygon`.
//!
//! The reference ABI entry point calls into OpenCV's `findContours`. This
//! crate has no OpenCV dependency, so it implements the narrower operation
//! actually needed here: threshold the mask to a binary image, find its
//! largest (by pixel area) 8-connected component, trace that component's
//! boundary with a Moore-neighbor walk, and return the boundary as a
//! collinear-compressed point list.

use ndarray::Array2;

const NEIGHBORS_8: [(i32, i32); 8] = [
    (-1, -1), (-1, 0), (-1, 1),
    (0, -1), (0, 1),
    (1, -1), (1, 0), (1, 1),
];

/// Trace the largest external contour of `mask.map(|v| v > threshold)` and
/// return up to `max_points` `(x, y)` pairs, in mask-local coordinates.
///
/// Returns an empty vector if the mask has no pixel above `threshold`, or if
/// the largest contour has 3 or fewer points (degenerate — not a polygon).
pub fn largest_contour(mask: &Array2<f32>, threshold: f32, max_points: usize) -> Vec<(i32, i32)> {
    let (rows, cols) = mask.dim();
    if rows == 0 || cols == 0 || max_points == 0 {
        return Vec::new();
    }

    let is_set = |r: i32, c: i32| -> bool {
        if r < 0 || c < 0 || r as usize >= rows || c as usize >= cols {
            return false;
        }
        mask[[r as usize, c as usize]] > threshold
    };

    let Some(start) = largest_component_start(mask, threshold, rows, cols) else {
        return Vec::new();
    };

    let contour = trace_boundary(start, is_set);
    if contour.len() <= 3 {
        return Vec::new();
    }

    let simplified = compress_collinear(&contour);

    // `trace_boundary` works in (row, col); the public contract is (x, y)
    // pairs, i.e. (col, row).
    simplified
        .into_iter()
        .map(|(row, col)| (col, row))
        .take(max_points)
        .collect()
}

/// Flood-fill every 8-connected component of set pixels and return the
/// top-leftmost pixel of whichever component has the greatest area, as the
/// entry point for `trace_boundary`.
fn largest_component_start(
    mask: &Array2<f32>,
    threshold: f32,
    rows: usize,
    cols: usize,
) -> Option<(i32, i32)> {
    let mut visited = vec![false; rows * cols];
    let mut best: Option<((i32, i32), usize)> = None;

    for r in 0..rows {
        for c in 0..cols {
            let idx = r * cols + c;
            if visited[idx] || mask[[r, c]] <= threshold {
                continue;
            }

            let mut stack = vec![(r as i32, c as i32)];
            visited[idx] = true;
            let mut area = 0usize;
            let mut top_left = (r as i32, c as i32);

            while let Some((cr, cc)) = stack.pop() {
                area += 1;
                if (cr, cc) < top_left {
                    top_left = (cr, cc);
                }
                for (dr, dc) in NEIGHBORS_8 {
                    let (nr, nc) = (cr + dr, cc + dc);
                    if nr < 0 || nc < 0 || nr as usize >= rows || nc as usize >= cols {
                        continue;
                    }
                    let nidx = nr as usize * cols + nc as usize;
                    if !visited[nidx] && mask[[nr as usize, nc as usize]] > threshold {
                        visited[nidx] = true;
                        stack.push((nr, nc));
                    }
                }
            }

            if best.as_ref().map_or(true, |&(_, best_area)| area > best_area) {
                best = Some((top_left, area));
            }
        }
    }

    best.map(|(start, _)| start)
}

/// Moore-neighbor tracing (8-connected), clockwise starting from the pixel
/// directly above the entry point's backtrack direction.
fn trace_boundary(start: (i32, i32), is_set: impl Fn(i32, i32) -> bool) -> Vec<(i32, i32)> {
    // Clockwise offsets starting "north".
    const NEIGHBORS: [(i32, i32); 8] = [
        (-1, 0),
        (-1, 1),
        (0, 1),
        (1, 1),
        (1, 0),
        (1, -1),
        (0, -1),
        (-1, -1),
    ];

    let mut contour = vec![start];
    let mut current = start;
    // The pixel we arrived from, conceptually "west" of the start pixel.
    let mut backtrack_dir = 6usize; // index into NEIGHBORS for (0, -1)

    loop {
        let mut found = None;
        for i in 0..8 {
            let dir = (backtrack_dir + 1 + i) % 8;
            let (dr, dc) = NEIGHBORS[dir];
            let candidate = (current.0 + dr, current.1 + dc);
            if is_set(candidate.0, candidate.1) {
                found = Some((candidate, dir));
                break;
            }
        }

        match found {
            Some((next, dir)) => {
                // Backtrack direction for the next step is the reverse of
                // the direction we just moved in.
                backtrack_dir = (dir + 4) % 8;
                if next == start && contour.len() > 1 {
                    break;
                }
                contour.push(next);
                current = next;
                if contour.len() > 1_000_000 {
                    // Runaway guard for a malformed (non-closing) trace.
                    break;
                }
            }
            None => break, // isolated single pixel
        }
    }

    contour
}

/// Collapse runs of collinear boundary points down to the endpoints of each
/// straight run, mirroring `CHAIN_APPROX_SIMPLE` so a long straight edge
/// costs one point instead of one per pixel of its length.
fn compress_collinear(points: &[(i32, i32)]) -> Vec<(i32, i32)> {
    let n = points.len();
    if n <= 2 {
        return points.to_vec();
    }

    let direction = |a: (i32, i32), b: (i32, i32)| -> (i32, i32) {
        ((b.0 - a.0).signum(), (b.1 - a.1).signum())
    };

    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let prev = points[(i + n - 1) % n];
        let cur = points[i];
        let next = points[(i + 1) % n];
        if direction(prev, cur) != direction(cur, next) {
            out.push(cur);
        }
    }

    if out.is_empty() {
        out.push(points[0]);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mask_yields_no_contour() {
        let mask = Array2::<f32>::zeros((8, 8));
        assert!(largest_contour(&mask, 0.5, 100).is_empty());
    }

    #[test]
    fn single_pixel_is_degenerate() {
        let mut mask = Array2::<f32>::zeros((8, 8));
        mask[[3, 3]] = 1.0;
        assert!(largest_contour(&mask, 0.5, 100).is_empty());
    }

    #[test]
    fn solid_square_traces_a_closed_boundary() {
        let mut mask = Array2::<f32>::zeros((10, 10));
        for r in 2..8 {
            for c in 2..8 {
                mask[[r, c]] = 1.0;
            }
        }
        let contour = largest_contour(&mask, 0.5, 1000);
        assert!(contour.len() > 3);
        for &(x, y) in &contour {
            assert!((2..8).contains(&x) || (2..8).contains(&y));
        }
    }

    #[test]
    fn picks_the_larger_of_two_disjoint_blobs() {
        let mut mask = Array2::<f32>::zeros((20, 20));
        // Small blob near the top-left: would be picked first by a scan that
        // stops at the first above-threshold pixel.
        for r in 1..4 {
            for c in 1..4 {
                mask[[r, c]] = 1.0;
            }
        }
        // Larger blob further along the scan order.
        for r in 10..18 {
            for c in 10..18 {
                mask[[r, c]] = 1.0;
            }
        }

        let contour = largest_contour(&mask, 0.5, 1000);
        assert!(!contour.is_empty());
        for &(x, y) in &contour {
            assert!((10..18).contains(&x) && (10..18).contains(&y));
        }
    }

    #[test]
    fn straight_edges_compress_to_their_corners() {
        let mut mask = Array2::<f32>::zeros((10, 10));
        for r in 2..8 {
            for c in 2..8 {
                mask[[r, c]] = 1.0;
            }
        }
        let contour = largest_contour(&mask, 0.5, 1000);
        // A solid rectangle has exactly four direction changes.
        assert_eq!(contour.len(), 4);
    }

    #[test]
    fn max_points_caps_output() {
        let mut mask = Array2::<f32>::zeros((24, 24));
        // A staircase shape: each row's run extends one column further than
        // the last, so the boundary has a vertex per row and collinear
        // compression doesn't collapse it down to a handful of corners.
        for r in 0..20 {
            for c in 2..(3 + r) {
                mask[[r + 2, c]] = 1.0;
            }
        }
        let contour = largest_contour(&mask, 0.5, 5);
        assert_eq!(contour.len(), 5);
    }
}
