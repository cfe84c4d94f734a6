//! `.prj` companion file: WKT CRS text

use std::path::Path;

/// Well-known ESRI projection names that carry no AUTHORITY clause
const ESRI_NAMES: &[(&str, i32)] = &[
    ("WGS_1984_Web_Mercator_Auxiliary_Sphere", 3857),
    ("WGS_84_Pseudo_Mercator", 3857),
    ("GCS_WGS_1984", 4326),
    ("GCS_China_Geodetic_Coordinate_System_2000", 4490),
    ("GCS_North_American_1983", 4269),
    ("GCS_ETRS_1989", 4258),
];

/// Extract an EPSG code from WKT CRS text.
///
/// The outermost `AUTHORITY["EPSG","<code>"]` is the last one in the text;
/// earlier ones belong to the datum, spheroid or units.
pub fn parse_epsg_from_wkt(wkt: &str) -> Option<i32> {
    const AUTHORITY: &str = "AUTHORITY[\"EPSG\",\"";
    if let Some(start) = wkt.rfind(AUTHORITY) {
        let code_start = start + AUTHORITY.len();
        if let Some(end) = wkt[code_start..].find('"') {
            if let Ok(code) = wkt[code_start..code_start + end].parse::<i32>() {
                return Some(code);
            }
        }
    }

    // WKT2 style ID["EPSG",4326]
    const ID: &str = "ID[\"EPSG\",";
    if let Some(start) = wkt.rfind(ID) {
        let code: String = wkt[start + ID.len()..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if let Ok(code) = code.parse::<i32>() {
            return Some(code);
        }
    }

    // Look for EPSG: prefix
    if let Some(start) = wkt.find("EPSG:") {
        let code: String = wkt[start + 5..].chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(code) = code.parse::<i32>() {
            return Some(code);
        }
    }

    // Projected names are listed first so they win over the GEOGCS they wrap
    ESRI_NAMES.iter().find(|(name, _)| wkt.contains(name)).map(|(_, code)| *code)
}

/// Read the SRID from a `.prj` file; 0 when absent or unrecognised
pub fn read_srid(prj_path: &Path) -> i32 {
    match std::fs::read_to_string(prj_path) {
        Ok(content) => parse_epsg_from_wkt(content.trim()).unwrap_or_else(|| {
            tracing::debug!(path = %prj_path.display(), "no EPSG code in .prj");
            0
        }),
        Err(_) => 0,
    }
}

/// WKT text to write into a `.prj` for well-known SRIDs
pub fn wkt_for_srid(srid: i32) -> Option<&'static str> {
    match srid {
        4326 => Some(
            r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563]],PRIMEM["Greenwich",0],UNIT["degree",0.0174532925199433],AUTHORITY["EPSG","4326"]]"#,
        ),
        3857 => Some(
            r#"PROJCS["WGS 84 / Pseudo-Mercator",GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563]],PRIMEM["Greenwich",0],UNIT["degree",0.0174532925199433]],PROJECTION["Mercator_1SP"],PARAMETER["central_meridian",0],PARAMETER["scale_factor",1],PARAMETER["false_easting",0],PARAMETER["false_northing",0],UNIT["metre",1],AUTHORITY["EPSG","3857"]]"#,
        ),
        _ => None,
    }
}
