use image::GrayImage;
use imageproc::{contours::find_contours, geometry::contour_area, point::Point};

use super::frame::BoundingBox;

/// Finds the droplet in an edge mask: the contour with the largest enclosed
/// area. `None` means the field of view is empty, which is routine.
pub fn locate_droplet(mask: &GrayImage) -> Option<BoundingBox> {
    let chains: Vec<Vec<Point<i32>>> = find_contours::<i32>(mask)
        .iter()
        .map(|contour| simplify_chain(&contour.points))
        .collect();
    select_largest(&chains)
}

/// Bounding box of the contour with strictly maximal area. Ties keep the
/// first contour in enumeration order; when every area is zero the first
/// contour still wins.
pub fn select_largest(contours: &[Vec<Point<i32>>]) -> Option<BoundingBox> {
    if contours.is_empty() {
        return None;
    }

    let mut best_index = 0;
    let mut best_area = 0.0;
    for (index, contour) in contours.iter().enumerate() {
        let area = contour_area(contour);
        if area > best_area {
            best_area = area;
            best_index = index;
        }
    }

    bounding_box(&contours[best_index])
}

/// Pixel-inclusive box, so a single point is 1x1.
pub fn bounding_box(points: &[Point<i32>]) -> Option<BoundingBox> {
    let first = points.first()?;
    let (mut min_x, mut max_x, mut min_y, mut max_y) = (first.x, first.x, first.y, first.y);
    for p in points {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    Some(BoundingBox::new(
        min_x.max(0) as u32,
        min_y.max(0) as u32,
        (max_x - min_x + 1) as u32,
        (max_y - min_y + 1) as u32,
    ))
}

/// Compresses straight horizontal, vertical and diagonal runs of a closed
/// border chain down to their end points.
pub fn simplify_chain(points: &[Point<i32>]) -> Vec<Point<i32>> {
    let n = points.len();
    if n <= 2 {
        return points.to_vec();
    }

    let step = |from: Point<i32>, to: Point<i32>| ((to.x - from.x).signum(), (to.y - from.y).signum());

    let kept: Vec<Point<i32>> = (0..n)
        .filter(|&i| {
            let prev = points[(i + n - 1) % n];
            let here = points[i];
            let next = points[(i + 1) % n];
            step(prev, here) != step(here, next)
        })
        .map(|i| points[i])
        .collect();

    if kept.is_empty() {
        vec![points[0]]
    } else {
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Vec<Point<i32>> {
        vec![
            Point::new(x, y),
            Point::new(x + w, y),
            Point::new(x + w, y + h),
            Point::new(x, y + h),
        ]
    }

    #[test]
    fn largest_area_contour_wins() {
        let contours = vec![rect(0, 0, 5, 1), rect(20, 30, 5, 8), rect(50, 5, 3, 4)];
        assert_eq!(contour_area(&contours[0]), 5.0);
        assert_eq!(contour_area(&contours[1]), 40.0);
        assert_eq!(contour_area(&contours[2]), 12.0);

        assert_eq!(
            select_largest(&contours),
            Some(BoundingBox::new(20, 30, 6, 9))
        );
    }

    #[test]
    fn ties_keep_first_encountered() {
        let contours = vec![rect(0, 0, 4, 4), rect(10, 10, 4, 4)];
        assert_eq!(select_largest(&contours), Some(BoundingBox::new(0, 0, 5, 5)));
    }

    #[test]
    fn no_contours_means_no_blob() {
        assert_eq!(select_largest(&[]), None);
        let blank = GrayImage::new(32, 32);
        assert_eq!(locate_droplet(&blank), None);
    }

    #[test]
    fn locates_the_bigger_of_two_regions() {
        let mask = GrayImage::from_fn(64, 64, |x, y| {
            let big = (10..30).contains(&x) && (20..32).contains(&y);
            let small = (45..48).contains(&x) && (5..8).contains(&y);
            if big || small {
                Luma([90])
            } else {
                Luma([0])
            }
        });

        assert_eq!(locate_droplet(&mask), Some(BoundingBox::new(10, 20, 20, 12)));
    }

    #[test]
    fn straight_runs_collapse_to_corners() {
        let mut border = Vec::new();
        for x in 0..4 {
            border.push(Point::new(x, 0));
        }
        for y in 1..4 {
            border.push(Point::new(3, y));
        }
        for x in (0..3).rev() {
            border.push(Point::new(x, 3));
        }
        for y in (1..3).rev() {
            border.push(Point::new(0, y));
        }

        let simplified = simplify_chain(&border);
        assert_eq!(
            simplified,
            vec![
                Point::new(0, 0),
                Point::new(3, 0),
                Point::new(3, 3),
                Point::new(0, 3)
            ]
        );
        assert_eq!(contour_area(&simplified), contour_area(&border));
    }
}
