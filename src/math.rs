use nalgebra as na;

use crate::Float;

/// Signed orientation of the triplet (a, b, c): zero when collinear, the sign
/// tells clockwise from counter-clockwise.
#[inline]
pub fn orientation<T: Float>(a: &na::Point2<T>, b: &na::Point2<T>, c: &na::Point2<T>) -> T {
    (b.y - a.y) * (c.x - b.x) - (b.x - a.x) * (c.y - b.y)
}

/// Whether `b` lies inside the bounding box of `a` and `c`. Only meaningful
/// for points already known to be collinear.
#[inline]
fn on_segment<T: Float>(a: &na::Point2<T>, b: &na::Point2<T>, c: &na::Point2<T>) -> bool {
    a.x.min(c.x) <= b.x && b.x <= a.x.max(c.x) && a.y.min(c.y) <= b.y && b.y <= a.y.max(c.y)
}

/// Checks whether segment `p1`-`p2` crosses or touches segment `p3`-`p4`.
pub fn segments_intersect<T: Float>(
    p1: &na::Point2<T>,
    p2: &na::Point2<T>,
    p3: &na::Point2<T>,
    p4: &na::Point2<T>,
) -> bool {
    let zero = T::zero();

    let o1 = orientation(p1, p2, p3);
    let o2 = orientation(p1, p2, p4);
    let o3 = orientation(p3, p4, p1);
    let o4 = orientation(p3, p4, p2);

    if o1 == zero && on_segment(p1, p3, p2) {
        return true;
    }

    if o2 == zero && on_segment(p1, p4, p2) {
        return true;
    }

    if o3 == zero && on_segment(p3, p1, p4) {
        return true;
    }

    if o4 == zero && on_segment(p3, p2, p4) {
        return true;
    }

    o1 * o2 < zero && o3 * o4 < zero
}

/// Shoelace area of an ordered polygon. Degenerate inputs (fewer than three
/// points) have zero area.
pub fn polygon_area<T: Float>(points: &[na::Point2<T>]) -> T {
    let n = points.len();
    if n < 3 {
        return T::zero();
    }

    let mut acc = T::zero();
    for i in 0..n {
        let a = &points[i];
        let b = &points[(i + 1) % n];
        acc = acc + (a.x * b.y - b.x * a.y);
    }

    (acc / (T::one() + T::one())).abs()
}
