//! British National Grid (EPSG:27700) <-> WGS84 (EPSG:4326).
//!
//! Ordnance Survey transverse Mercator on the Airy 1830 ellipsoid, followed by a
//! seven-parameter Helmert transform between the OSGB36 and WGS84 datums.
//! Accurate to roughly 5 m, which is plenty for web-map display. Builds with the
//! `proj` feature use PROJ instead.

use std::f64::consts::PI;

struct Ellipsoid {
    a: f64,
    b: f64,
}

const AIRY_1830: Ellipsoid = Ellipsoid {
    a: 6_377_563.396,
    b: 6_356_256.909,
};

const WGS84: Ellipsoid = Ellipsoid {
    a: 6_378_137.0,
    b: 6_356_752.314_245,
};

/// Scale factor on the central meridian
const F0: f64 = 0.999_601_271_7;
/// True origin, 49°N 2°W
const LAT0_DEG: f64 = 49.0;
const LON0_DEG: f64 = -2.0;
/// False origin
const E0: f64 = 400_000.0;
const N0: f64 = -100_000.0;

/// WGS84 -> OSGB36 Helmert parameters (metres, ppm, arc-seconds)
struct Helmert {
    tx: f64,
    ty: f64,
    tz: f64,
    s_ppm: f64,
    rx_sec: f64,
    ry_sec: f64,
    rz_sec: f64,
}

const WGS84_TO_OSGB36: Helmert = Helmert {
    tx: -446.448,
    ty: 125.157,
    tz: -542.060,
    s_ppm: 20.4894,
    rx_sec: -0.1502,
    ry_sec: -0.2470,
    rz_sec: -0.8421,
};

impl Helmert {
    fn inverse(&self) -> Helmert {
        Helmert {
            tx: -self.tx,
            ty: -self.ty,
            tz: -self.tz,
            s_ppm: -self.s_ppm,
            rx_sec: -self.rx_sec,
            ry_sec: -self.ry_sec,
            rz_sec: -self.rz_sec,
        }
    }

    fn apply(&self, (x, y, z): (f64, f64, f64)) -> (f64, f64, f64) {
        let sec = PI / (180.0 * 3600.0);
        let s1 = 1.0 + self.s_ppm * 1e-6;
        let (rx, ry, rz) = (self.rx_sec * sec, self.ry_sec * sec, self.rz_sec * sec);
        (
            self.tx + s1 * x - rz * y + ry * z,
            self.ty + rz * x + s1 * y - rx * z,
            self.tz - ry * x + rx * y + s1 * z,
        )
    }
}

fn e2(ell: &Ellipsoid) -> f64 {
    1.0 - (ell.b * ell.b) / (ell.a * ell.a)
}

fn to_cartesian(ell: &Ellipsoid, lat: f64, lon: f64) -> (f64, f64, f64) {
    let e2 = e2(ell);
    let nu = ell.a / (1.0 - e2 * lat.sin().powi(2)).sqrt();
    (
        nu * lat.cos() * lon.cos(),
        nu * lat.cos() * lon.sin(),
        (1.0 - e2) * nu * lat.sin(),
    )
}

fn from_cartesian(ell: &Ellipsoid, (x, y, z): (f64, f64, f64)) -> (f64, f64) {
    let e2 = e2(ell);
    let p = (x * x + y * y).sqrt();
    let mut lat = z.atan2(p * (1.0 - e2));
    for _ in 0..10 {
        let nu = ell.a / (1.0 - e2 * lat.sin().powi(2)).sqrt();
        let next = (z + e2 * nu * lat.sin()).atan2(p);
        let done = (next - lat).abs() < 1e-12;
        lat = next;
        if done {
            break;
        }
    }
    (lat, y.atan2(x))
}

/// Meridional arc from the true origin latitude to `lat`
fn meridional_arc(lat: f64) -> f64 {
    let Ellipsoid { a, b } = AIRY_1830;
    let n = (a - b) / (a + b);
    let (n2, n3) = (n * n, n * n * n);
    let lat0 = LAT0_DEG.to_radians();
    let dl = lat - lat0;
    let sl = lat + lat0;
    b * F0
        * ((1.0 + n + 1.25 * n2 + 1.25 * n3) * dl
            - (3.0 * n + 3.0 * n2 + 2.625 * n3) * dl.sin() * sl.cos()
            + (1.875 * n2 + 1.875 * n3) * (2.0 * dl).sin() * (2.0 * sl).cos()
            - (35.0 / 24.0) * n3 * (3.0 * dl).sin() * (3.0 * sl).cos())
}

fn radii(lat: f64) -> (f64, f64, f64) {
    let Ellipsoid { a, .. } = AIRY_1830;
    let e2 = e2(&AIRY_1830);
    let s2 = 1.0 - e2 * lat.sin().powi(2);
    let nu = a * F0 / s2.sqrt();
    let rho = a * F0 * (1.0 - e2) / s2.powf(1.5);
    let eta2 = nu / rho - 1.0;
    (nu, rho, eta2)
}

/// OSGB36 latitude/longitude (degrees) -> grid easting/northing
pub(crate) fn project_osgb36(lat_deg: f64, lon_deg: f64) -> (f64, f64) {
    let lat = lat_deg.to_radians();
    let dlon = (lon_deg - LON0_DEG).to_radians();
    let (nu, rho, eta2) = radii(lat);
    let (sin, cos, tan) = (lat.sin(), lat.cos(), lat.tan());
    let tan2 = tan * tan;
    let tan4 = tan2 * tan2;

    let i = meridional_arc(lat) + N0;
    let ii = nu / 2.0 * sin * cos;
    let iii = nu / 24.0 * sin * cos.powi(3) * (5.0 - tan2 + 9.0 * eta2);
    let iiia = nu / 720.0 * sin * cos.powi(5) * (61.0 - 58.0 * tan2 + tan4);
    let iv = nu * cos;
    let v = nu / 6.0 * cos.powi(3) * (nu / rho - tan2);
    let vi = nu / 120.0
        * cos.powi(5)
        * (5.0 - 18.0 * tan2 + tan4 + 14.0 * eta2 - 58.0 * tan2 * eta2);

    let northing = i + ii * dlon.powi(2) + iii * dlon.powi(4) + iiia * dlon.powi(6);
    let easting = E0 + iv * dlon + v * dlon.powi(3) + vi * dlon.powi(5);
    (easting, northing)
}

/// Grid easting/northing -> OSGB36 latitude/longitude (degrees)
pub(crate) fn unproject_osgb36(easting: f64, northing: f64) -> (f64, f64) {
    let Ellipsoid { a, .. } = AIRY_1830;
    let lat0 = LAT0_DEG.to_radians();

    let mut lat = lat0;
    let mut m = 0.0;
    loop {
        lat += (northing - N0 - m) / (a * F0);
        m = meridional_arc(lat);
        if (northing - N0 - m).abs() < 1e-5 {
            break;
        }
    }

    let (nu, rho, eta2) = radii(lat);
    let tan = lat.tan();
    let sec = 1.0 / lat.cos();
    let (tan2, tan4, tan6) = (tan.powi(2), tan.powi(4), tan.powi(6));

    let vii = tan / (2.0 * rho * nu);
    let viii = tan / (24.0 * rho * nu.powi(3)) * (5.0 + 3.0 * tan2 + eta2 - 9.0 * tan2 * eta2);
    let ix = tan / (720.0 * rho * nu.powi(5)) * (61.0 + 90.0 * tan2 + 45.0 * tan4);
    let x = sec / nu;
    let xi = sec / (6.0 * nu.powi(3)) * (nu / rho + 2.0 * tan2);
    let xii = sec / (120.0 * nu.powi(5)) * (5.0 + 28.0 * tan2 + 24.0 * tan4);
    let xiia = sec / (5040.0 * nu.powi(7)) * (61.0 + 662.0 * tan2 + 1320.0 * tan4 + 720.0 * tan6);

    let de = easting - E0;
    let lat = lat - vii * de.powi(2) + viii * de.powi(4) - ix * de.powi(6);
    let lon = LON0_DEG.to_radians() + x * de - xi * de.powi(3) + xii * de.powi(5)
        - xiia * de.powi(7);
    (lat.to_degrees(), lon.to_degrees())
}

/// Easting/northing (EPSG:27700) -> longitude/latitude (EPSG:4326)
pub fn to_wgs84(easting: f64, northing: f64) -> (f64, f64) {
    let (lat, lon) = unproject_osgb36(easting, northing);
    let osgb = to_cartesian(&AIRY_1830, lat.to_radians(), lon.to_radians());
    let wgs = WGS84_TO_OSGB36.inverse().apply(osgb);
    let (lat, lon) = from_cartesian(&WGS84, wgs);
    (lon.to_degrees(), lat.to_degrees())
}

/// Longitude/latitude (EPSG:4326) -> easting/northing (EPSG:27700)
pub fn from_wgs84(lon: f64, lat: f64) -> (f64, f64) {
    let wgs = to_cartesian(&WGS84, lat.to_radians(), lon.to_radians());
    let osgb = WGS84_TO_OSGB36.apply(wgs);
    let (lat, lon) = from_cartesian(&AIRY_1830, osgb);
    project_osgb36(lat.to_degrees(), lon.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dms(d: f64, m: f64, s: f64) -> f64 {
        d + m / 60.0 + s / 3600.0
    }

    // Worked example from the Ordnance Survey guide to coordinate systems
    #[test]
    fn test_projection_worked_example() {
        let lat = dms(52.0, 39.0, 27.2531);
        let lon = dms(1.0, 43.0, 4.5177);
        let (e, n) = project_osgb36(lat, lon);
        assert!((e - 651_409.903).abs() < 0.01, "easting {}", e);
        assert!((n - 313_177.270).abs() < 0.01, "northing {}", n);
    }

    #[test]
    fn test_inverse_projection_worked_example() {
        let (lat, lon) = unproject_osgb36(651_409.903, 313_177.270);
        assert!((lat - dms(52.0, 39.0, 27.2531)).abs() < 1e-6, "lat {}", lat);
        assert!((lon - dms(1.0, 43.0, 4.5177)).abs() < 1e-6, "lon {}", lon);
    }

    #[test]
    fn test_norwich_to_wgs84() {
        // TG 230 085, Norwich city centre
        let (lon, lat) = to_wgs84(623_000.0, 308_500.0);
        assert!((lat - 52.63).abs() < 0.02, "lat {}", lat);
        assert!((lon - 1.29).abs() < 0.02, "lon {}", lon);
    }

    #[test]
    fn test_datum_shift_round_trip() {
        let (lon, lat) = to_wgs84(623_000.0, 308_500.0);
        let (e, n) = from_wgs84(lon, lat);
        // Helmert inverse is approximate, centimetre level is expected
        assert!((e - 623_000.0).abs() < 0.5, "easting {}", e);
        assert!((n - 308_500.0).abs() < 0.5, "northing {}", n);
    }
}
