use geo::algorithm::orient::{Direction, Orient};
use geo::{
    Area, BooleanOps, Coord, EuclideanDistance, Geometry, InteriorPoint, LineString, MultiPolygon,
    Point, Polygon,
};
use std::borrow::Cow;
use std::cmp::Ordering;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Polygonal content of a geometry as a MultiPolygon.
/// Returns None for points, lines and collections without polygons.
pub fn to_multi_polygon(geometry: &Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geometry {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Some(mp.clone()),
        Geometry::Rect(r) => Some(MultiPolygon::new(vec![r.to_polygon()])),
        Geometry::Triangle(t) => Some(MultiPolygon::new(vec![t.to_polygon()])),
        Geometry::GeometryCollection(gc) => {
            let polygons: Vec<Polygon<f64>> = gc
                .0
                .iter()
                .filter_map(to_multi_polygon)
                .flat_map(|mp| mp.0)
                .collect();
            if polygons.is_empty() {
                None
            } else {
                Some(MultiPolygon::new(polygons))
            }
        }
        _ => None,
    }
}

/// MultiPolygon back to the simplest geometry (a single Polygon when possible)
pub fn from_multi_polygon(mut mp: MultiPolygon<f64>) -> Geometry<f64> {
    if mp.0.len() == 1 {
        if let Some(p) = mp.0.pop() {
            return Geometry::Polygon(p);
        }
    }
    Geometry::MultiPolygon(mp)
}

/// Cascaded union: pairs are merged level by level, which keeps each boolean
/// operation small compared to folding everything into one accumulator.
pub fn union_all(polygons: Vec<MultiPolygon<f64>>) -> MultiPolygon<f64> {
    let mut level = polygons;
    if level.is_empty() {
        return MultiPolygon::new(Vec::new());
    }

    while level.len() > 1 {
        #[cfg(feature = "rayon")]
        let next: Vec<MultiPolygon<f64>> = level.par_chunks(2).map(merge_pair).collect();
        #[cfg(not(feature = "rayon"))]
        let next: Vec<MultiPolygon<f64>> = level.chunks(2).map(merge_pair).collect();
        level = next;
    }

    level.pop().unwrap_or_else(|| MultiPolygon::new(Vec::new()))
}

fn merge_pair(pair: &[MultiPolygon<f64>]) -> MultiPolygon<f64> {
    match pair {
        [a, b] => a.union(b),
        [a] => a.clone(),
        _ => MultiPolygon::new(Vec::new()),
    }
}

/// A point guaranteed to lie inside the geometry
pub fn representative_point(geometry: &Geometry<f64>) -> Option<Point<f64>> {
    geometry.interior_point()
}

/// Planar area in layer units
pub fn area(geometry: &Geometry<f64>) -> f64 {
    geometry.unsigned_area()
}

pub fn is_empty(geometry: &Geometry<f64>) -> bool {
    match geometry {
        Geometry::Point(p) => p.x().is_nan() || p.y().is_nan(),
        Geometry::LineString(ls) => ls.0.is_empty(),
        Geometry::Polygon(p) => p.exterior().0.is_empty(),
        Geometry::MultiPoint(mp) => mp.0.is_empty(),
        Geometry::MultiLineString(mls) => mls.0.iter().all(|ls| ls.0.is_empty()),
        Geometry::MultiPolygon(mp) => mp.0.iter().all(|p| p.exterior().0.is_empty()),
        Geometry::GeometryCollection(gc) => gc.0.iter().all(is_empty),
        _ => false,
    }
}

fn cmp_coord(a: &Coord<f64>, b: &Coord<f64>) -> Ordering {
    a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y))
}

/// Rotate a closed ring so it starts at its smallest coordinate
fn normalize_ring(ring: &LineString<f64>) -> LineString<f64> {
    let coords = &ring.0;
    if coords.len() < 2 {
        return ring.clone();
    }
    let open = if coords.first() == coords.last() {
        &coords[..coords.len() - 1]
    } else {
        &coords[..]
    };
    let start = open
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| cmp_coord(a, b))
        .map(|(i, _)| i)
        .unwrap_or(0);

    let mut rotated: Vec<Coord<f64>> = open[start..].iter().chain(&open[..start]).copied().collect();
    if let Some(first) = rotated.first().copied() {
        rotated.push(first);
    }
    LineString::new(rotated)
}

fn normalize_polygon(polygon: &Polygon<f64>) -> Polygon<f64> {
    // Reversed: clockwise shell, counter-clockwise holes
    let oriented = polygon.orient(Direction::Reversed);
    let exterior = normalize_ring(oriented.exterior());
    let mut interiors: Vec<LineString<f64>> =
        oriented.interiors().iter().map(normalize_ring).collect();
    interiors.sort_by(|a, b| cmp_rings(a, b));
    Polygon::new(exterior, interiors)
}

fn cmp_rings(a: &LineString<f64>, b: &LineString<f64>) -> Ordering {
    for (ca, cb) in a.0.iter().zip(&b.0) {
        let o = cmp_coord(ca, cb);
        if o != Ordering::Equal {
            return o;
        }
    }
    a.0.len().cmp(&b.0.len())
}

/// Canonical form of a geometry so that equal shapes compare equal regardless of
/// ring direction, ring start vertex or part order.
pub fn normalize(geometry: &Geometry<f64>) -> Geometry<f64> {
    match geometry {
        Geometry::Polygon(p) => Geometry::Polygon(normalize_polygon(p)),
        Geometry::MultiPolygon(mp) => {
            let mut polygons: Vec<Polygon<f64>> = mp.0.iter().map(normalize_polygon).collect();
            polygons.sort_by(|a, b| cmp_rings(a.exterior(), b.exterior()));
            Geometry::MultiPolygon(MultiPolygon::new(polygons))
        }
        Geometry::LineString(ls) => {
            let mut ls = ls.clone();
            if let (Some(first), Some(last)) = (ls.0.first(), ls.0.last()) {
                if cmp_coord(last, first) == Ordering::Less {
                    ls.0.reverse();
                }
            }
            Geometry::LineString(ls)
        }
        Geometry::MultiPoint(mp) => {
            let mut points = mp.0.clone();
            points.sort_by(|a, b| cmp_coord(&a.0, &b.0));
            Geometry::MultiPoint(points.into())
        }
        Geometry::GeometryCollection(gc) => {
            Geometry::GeometryCollection(gc.0.iter().map(normalize).collect())
        }
        other => other.clone(),
    }
}

/// Hashable identity of a geometry after normalization
pub fn geometry_key(geometry: &Geometry<f64>) -> String {
    format!("{:?}", normalize(geometry))
}

// Structural validity and repair without GEOS

#[cfg(not(feature = "geos"))]
use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
#[cfg(not(feature = "geos"))]
use geo::{Contains, Line, RemoveRepeatedPoints};

#[cfg(not(feature = "geos"))]
fn ring_is_valid(ring: &LineString<f64>) -> bool {
    let coords = &ring.0;
    if coords.len() < 4 || coords.first() != coords.last() {
        return false;
    }
    if coords.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return false;
    }
    if Polygon::new(ring.clone(), vec![]).unsigned_area() <= 0.0 {
        return false;
    }
    !ring_self_intersects(ring)
}

#[cfg(not(feature = "geos"))]
fn ring_self_intersects(ring: &LineString<f64>) -> bool {
    let segments: Vec<Line<f64>> = ring.lines().filter(|l| l.start != l.end).collect();
    let n = segments.len();
    for i in 0..n {
        for j in (i + 1)..n {
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            match line_intersection(segments[i], segments[j]) {
                None => {}
                // Consecutive segments meet at their shared vertex; only an overlap is a spike
                Some(LineIntersection::SinglePoint { .. }) if adjacent => {}
                Some(_) => return true,
            }
        }
    }
    false
}

#[cfg(not(feature = "geos"))]
fn polygon_is_valid(polygon: &Polygon<f64>) -> bool {
    if !ring_is_valid(polygon.exterior()) {
        return false;
    }
    let shell = Polygon::new(polygon.exterior().clone(), vec![]);
    polygon
        .interiors()
        .iter()
        .all(|hole| ring_is_valid(hole) && shell.contains(hole))
}

/// Structural validity of polygonal geometries; other geometry types are
/// considered valid when every coordinate is finite.
#[cfg(not(feature = "geos"))]
pub fn is_valid(geometry: &Geometry<f64>) -> bool {
    match to_multi_polygon(geometry) {
        Some(mp) => mp.0.iter().all(polygon_is_valid),
        None => geo::CoordsIter::coords_iter(geometry).all(|c| c.x.is_finite() && c.y.is_finite()),
    }
}

#[cfg(feature = "geos")]
pub fn is_valid(geometry: &Geometry<f64>) -> bool {
    use geos::Geom;
    match geos::Geometry::try_from(geometry) {
        Ok(g) => g.is_valid(),
        Err(_) => false,
    }
}

#[cfg(not(feature = "geos"))]
fn clean_ring(ring: &LineString<f64>) -> Option<LineString<f64>> {
    let mut coords: Vec<Coord<f64>> = ring
        .remove_repeated_points()
        .0
        .into_iter()
        .filter(|c| c.x.is_finite() && c.y.is_finite())
        .collect();
    if let (Some(first), Some(last)) = (coords.first().copied(), coords.last().copied()) {
        if first != last {
            coords.push(first);
        }
    }
    let ring = LineString::new(coords);
    if ring.0.len() < 4 {
        return None;
    }
    // A bow-tie has a zero signed area but two real lobes
    if Polygon::new(ring.clone(), vec![]).unsigned_area() <= 0.0 && !ring_self_intersects(&ring) {
        return None;
    }
    Some(ring)
}

#[cfg(not(feature = "geos"))]
fn clean_polygon(polygon: &Polygon<f64>) -> Option<Polygon<f64>> {
    let exterior = clean_ring(polygon.exterior())?;
    let shell = Polygon::new(exterior.clone(), vec![]);
    let interiors = polygon
        .interiors()
        .iter()
        .filter_map(clean_ring)
        .filter(|hole| shell.contains(hole))
        .collect();
    Some(Polygon::new(exterior, interiors))
}

/// Valid parts of one polygon. Rings that still cross themselves after
/// cleaning are rebuilt by the boolean overlay, which splits them at their
/// crossings.
#[cfg(not(feature = "geos"))]
fn repair_polygon(polygon: &Polygon<f64>) -> Vec<Polygon<f64>> {
    let Some(cleaned) = clean_polygon(polygon) else {
        return Vec::new();
    };
    if polygon_is_valid(&cleaned) {
        return vec![cleaned];
    }
    let overlaid = MultiPolygon::new(vec![cleaned]).union(&MultiPolygon::new(Vec::new()));
    overlaid
        .0
        .into_iter()
        .filter(|p| p.unsigned_area() > 0.0)
        .collect()
}

/// Repair a polygonal geometry: drop repeated and non-finite vertices, close
/// rings, remove degenerate rings and holes lying outside their shell, and
/// split self-intersecting rings into their valid lobes.
/// Non-polygonal geometries are returned unchanged.
#[cfg(not(feature = "geos"))]
pub fn make_valid(geometry: &Geometry<f64>) -> Geometry<f64> {
    let Some(mp) = to_multi_polygon(geometry) else {
        return geometry.clone();
    };
    let repaired: Vec<Polygon<f64>> = mp.0.iter().flat_map(repair_polygon).collect();
    match geometry {
        Geometry::Polygon(_) if repaired.len() == 1 => from_multi_polygon(MultiPolygon::new(repaired)),
        _ => Geometry::MultiPolygon(MultiPolygon::new(repaired)),
    }
}

#[cfg(feature = "geos")]
pub fn make_valid(geometry: &Geometry<f64>) -> Geometry<f64> {
    use geos::Geom;
    let repaired = geos::Geometry::try_from(geometry)
        .and_then(|g| g.make_valid())
        .and_then(|g| Geometry::<f64>::try_from(g));
    match repaired {
        Ok(g) => g,
        Err(e) => {
            tracing::warn!("GEOS make_valid failed, keeping geometry as is: {}", e);
            geometry.clone()
        }
    }
}

/// Borrowed building blocks of a geometry for distance computations
enum Part<'a> {
    Point(Point<f64>),
    Line(Cow<'a, LineString<f64>>),
    Poly(Cow<'a, Polygon<f64>>),
}

fn parts(geometry: &Geometry<f64>) -> Vec<Part<'_>> {
    match geometry {
        Geometry::Point(p) => vec![Part::Point(*p)],
        Geometry::Line(l) => vec![Part::Line(Cow::Owned(LineString::from(vec![l.start, l.end])))],
        Geometry::LineString(ls) => vec![Part::Line(Cow::Borrowed(ls))],
        Geometry::Polygon(p) => vec![Part::Poly(Cow::Borrowed(p))],
        Geometry::MultiPoint(mp) => mp.0.iter().map(|p| Part::Point(*p)).collect(),
        Geometry::MultiLineString(mls) => {
            mls.0.iter().map(|ls| Part::Line(Cow::Borrowed(ls))).collect()
        }
        Geometry::MultiPolygon(mp) => mp.0.iter().map(|p| Part::Poly(Cow::Borrowed(p))).collect(),
        Geometry::Rect(r) => vec![Part::Poly(Cow::Owned(r.to_polygon()))],
        Geometry::Triangle(t) => vec![Part::Poly(Cow::Owned(t.to_polygon()))],
        Geometry::GeometryCollection(gc) => gc.0.iter().flat_map(parts).collect(),
    }
}

fn part_distance(a: &Part<'_>, b: &Part<'_>) -> f64 {
    match (a, b) {
        (Part::Point(p), Part::Point(q)) => p.euclidean_distance(q),
        (Part::Point(p), Part::Line(l)) => p.euclidean_distance(&**l),
        (Part::Point(p), Part::Poly(poly)) => p.euclidean_distance(&**poly),
        (Part::Line(l), Part::Point(p)) => (**l).euclidean_distance(p),
        (Part::Line(l), Part::Line(m)) => (**l).euclidean_distance(&**m),
        (Part::Line(l), Part::Poly(poly)) => (**l).euclidean_distance(&**poly),
        (Part::Poly(poly), Part::Point(p)) => (**poly).euclidean_distance(p),
        (Part::Poly(poly), Part::Line(l)) => (**poly).euclidean_distance(&**l),
        (Part::Poly(a), Part::Poly(b)) => (**a).euclidean_distance(&**b),
    }
}

/// Minimum Euclidean distance between two geometries, 0 when they intersect.
/// Returns None when either geometry is empty.
pub fn min_distance(a: &Geometry<f64>, b: &Geometry<f64>) -> Option<f64> {
    let pa = parts(a);
    let pb = parts(b);
    pa.iter()
        .flat_map(|x| pb.iter().map(move |y| part_distance(x, y)))
        .filter(|d| d.is_finite())
        .min_by(|x, y| x.total_cmp(y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon, Contains};

    fn square(x: f64, y: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x, y: y),
            (x: x + size, y: y),
            (x: x + size, y: y + size),
            (x: x, y: y + size),
            (x: x, y: y),
        ]
    }

    #[test]
    fn test_union_all_merges_adjacent_squares() {
        let polys = (0..5)
            .map(|i| MultiPolygon::new(vec![square(i as f64 * 10.0, 0.0, 10.0)]))
            .collect();
        let union = union_all(polys);
        assert_eq!(union.0.len(), 1);
        assert!((union.unsigned_area() - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_union_all_empty() {
        assert!(union_all(Vec::new()).0.is_empty());
    }

    #[test]
    fn test_representative_point_is_inside() {
        // L-shaped parcel whose centroid falls outside the polygon
        let l_shape: Polygon<f64> = polygon![
            (x: 0.0, y: 0.0),
            (x: 100.0, y: 0.0),
            (x: 100.0, y: 10.0),
            (x: 10.0, y: 10.0),
            (x: 10.0, y: 100.0),
            (x: 0.0, y: 100.0),
            (x: 0.0, y: 0.0),
        ];
        let g = Geometry::Polygon(l_shape.clone());
        let p = representative_point(&g).unwrap();
        assert!(l_shape.contains(&p));
    }

    #[test]
    fn test_normalize_ignores_direction_and_start() {
        let a = Geometry::Polygon(square(0.0, 0.0, 1.0));
        let b: Polygon<f64> = polygon![
            (x: 1.0, y: 1.0),
            (x: 1.0, y: 0.0),
            (x: 0.0, y: 0.0),
            (x: 0.0, y: 1.0),
            (x: 1.0, y: 1.0),
        ];
        let b = Geometry::Polygon(b);
        assert_eq!(normalize(&a), normalize(&b));
        assert_eq!(geometry_key(&a), geometry_key(&b));
        assert_ne!(
            geometry_key(&a),
            geometry_key(&Geometry::Polygon(square(0.0, 0.0, 2.0)))
        );
    }

    #[test]
    fn test_validity_and_repair() {
        let good = Geometry::Polygon(square(0.0, 0.0, 10.0));
        assert!(is_valid(&good));

        let bow_tie: Polygon<f64> = polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 10.0),
            (x: 10.0, y: 0.0),
            (x: 0.0, y: 10.0),
            (x: 0.0, y: 0.0),
        ];
        assert!(!is_valid(&Geometry::Polygon(bow_tie)));

        // hole outside its shell
        let bad_hole = Polygon::new(
            square(0.0, 0.0, 10.0).exterior().clone(),
            vec![square(20.0, 20.0, 1.0).exterior().clone()],
        );
        let bad = Geometry::Polygon(bad_hole);
        assert!(!is_valid(&bad));
        let repaired = make_valid(&bad);
        assert!(is_valid(&repaired));
        #[cfg(not(feature = "geos"))]
        assert!((area(&repaired) - 100.0).abs() < 1e-9);
        // GEOS may keep the stray hole as a polygon of its own
        #[cfg(feature = "geos")]
        assert!(area(&repaired) > 100.0 - 1e-9 && area(&repaired) < 101.0 + 1e-9);
    }

    fn assert_repaired_lobes(shape: Polygon<f64>, expected_area: f64) {
        let g = Geometry::Polygon(shape);
        assert!(!is_valid(&g));
        let repaired = make_valid(&g);
        assert!(is_valid(&repaired));
        assert!(!is_empty(&repaired));
        assert!((area(&repaired) - expected_area).abs() < 1e-6);
    }

    #[test]
    fn test_make_valid_splits_symmetric_bow_tie() {
        // Zero signed area; each triangular lobe covers 10000 m2
        let bow_tie: Polygon<f64> = polygon![
            (x: 0.0, y: 0.0),
            (x: 200.0, y: 200.0),
            (x: 200.0, y: 0.0),
            (x: 0.0, y: 200.0),
            (x: 0.0, y: 0.0),
        ];
        assert_repaired_lobes(bow_tie, 20_000.0);
    }

    #[test]
    fn test_make_valid_splits_asymmetric_bow_tie() {
        // Crossing at (200/3, 200/3): lobes of 10000/3 and 40000/3 m2,
        // while the shoelace formula gives 10000
        let bow_tie: Polygon<f64> = polygon![
            (x: 0.0, y: 0.0),
            (x: 200.0, y: 200.0),
            (x: 200.0, y: 0.0),
            (x: 0.0, y: 100.0),
            (x: 0.0, y: 0.0),
        ];
        assert_repaired_lobes(bow_tie, 50_000.0 / 3.0);
    }

    #[test]
    fn test_min_distance() {
        let a = Geometry::Polygon(square(0.0, 0.0, 10.0));
        let b = Geometry::Polygon(square(13.0, 0.0, 10.0));
        assert!((min_distance(&a, &b).unwrap() - 3.0).abs() < 1e-9);

        let inside = Geometry::Point(point!(x: 5.0, y: 5.0));
        assert_eq!(min_distance(&a, &inside), Some(0.0));

        let line = Geometry::LineString(LineString::from(vec![(0.0, 14.0), (10.0, 14.0)]));
        assert!((min_distance(&line, &a).unwrap() - 4.0).abs() < 1e-9);

        let empty = Geometry::MultiPolygon(MultiPolygon::new(vec![]));
        assert_eq!(min_distance(&a, &empty), None);
    }

    #[test]
    fn test_to_multi_polygon() {
        assert!(to_multi_polygon(&Geometry::Point(point!(x: 0.0, y: 0.0))).is_none());
        let mp = to_multi_polygon(&Geometry::Polygon(square(0.0, 0.0, 1.0))).unwrap();
        assert_eq!(mp.0.len(), 1);
        assert!(matches!(from_multi_polygon(mp), Geometry::Polygon(_)));
    }
}
