// src/publish/geojson.rs
//
// Portal geometry JSON → RFC 7946 GeoJSON geometry.

use serde_json::{json, Value};

type Ring = Vec<Vec<f64>>;

/// Shoelace sum; negative for clockwise rings in an x-right / y-up frame.
fn signed_area(ring: &[Vec<f64>]) -> f64 {
    ring.windows(2)
        .filter(|w| w[0].len() >= 2 && w[1].len() >= 2)
        .map(|w| w[0][0] * w[1][1] - w[1][0] * w[0][1])
        .sum::<f64>()
        / 2.0
}

/// Group portal rings into GeoJSON polygons. Portal exteriors are clockwise
/// and holes counter-clockwise; GeoJSON wants the opposite, so every ring is
/// reversed. A hole seen before any exterior is promoted to an exterior.
fn rings_to_polygons(rings: Vec<Ring>) -> Vec<Vec<Ring>> {
    let mut polygons: Vec<Vec<Ring>> = Vec::new();
    for mut ring in rings {
        if ring.len() < 4 {
            continue;
        }
        let clockwise = signed_area(&ring) < 0.0;
        match (clockwise, polygons.last_mut()) {
            (true, _) => {
                ring.reverse();
                polygons.push(vec![ring]);
            }
            (false, Some(polygon)) => {
                ring.reverse();
                polygon.push(ring);
            }
            (false, None) => polygons.push(vec![ring]),
        }
    }
    polygons
}

/// `None` for a null geometry or a shape this converter does not know.
pub fn esri_to_geojson(geometry: &Value) -> Option<Value> {
    if let (Some(x), Some(y)) = (
        geometry.get("x").and_then(Value::as_f64),
        geometry.get("y").and_then(Value::as_f64),
    ) {
        return Some(json!({"type": "Point", "coordinates": [x, y]}));
    }
    if let Some(points) = geometry.get("points") {
        let points: Vec<Vec<f64>> = serde_json::from_value(points.clone()).ok()?;
        return Some(json!({"type": "MultiPoint", "coordinates": points}));
    }
    if let Some(paths) = geometry.get("paths") {
        let mut paths: Vec<Ring> = serde_json::from_value(paths.clone()).ok()?;
        return Some(if paths.len() == 1 {
            json!({"type": "LineString", "coordinates": paths.remove(0)})
        } else {
            json!({"type": "MultiLineString", "coordinates": paths})
        });
    }
    if let Some(rings) = geometry.get("rings") {
        let rings: Vec<Ring> = serde_json::from_value(rings.clone()).ok()?;
        let mut polygons = rings_to_polygons(rings);
        return match polygons.len() {
            0 => None,
            1 => Some(json!({"type": "Polygon", "coordinates": polygons.remove(0)})),
            _ => Some(json!({"type": "MultiPolygon", "coordinates": polygons})),
        };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // clockwise square
    fn outer() -> Value {
        json!([[0.0, 0.0], [0.0, 4.0], [4.0, 4.0], [4.0, 0.0], [0.0, 0.0]])
    }

    // counter-clockwise inner square
    fn hole() -> Value {
        json!([[1.0, 1.0], [2.0, 1.0], [2.0, 2.0], [1.0, 2.0], [1.0, 1.0]])
    }

    #[test]
    fn test_polygon_with_hole_is_reoriented() {
        let g = esri_to_geojson(&json!({"rings": [outer(), hole()]})).unwrap();
        assert_eq!(g["type"], "Polygon");
        let rings: Vec<Ring> = serde_json::from_value(g["coordinates"].clone()).unwrap();
        assert_eq!(rings.len(), 2);
        assert!(signed_area(&rings[0]) > 0.0);
        assert!(signed_area(&rings[1]) < 0.0);
    }

    #[test]
    fn test_two_exteriors_make_multipolygon() {
        let far = json!([[10.0, 10.0], [10.0, 11.0], [11.0, 11.0], [11.0, 10.0], [10.0, 10.0]]);
        let g = esri_to_geojson(&json!({"rings": [outer(), hole(), far]})).unwrap();
        assert_eq!(g["type"], "MultiPolygon");
        assert_eq!(g["coordinates"].as_array().unwrap().len(), 2);
        assert_eq!(g["coordinates"][0].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_point_and_unknown() {
        let p = esri_to_geojson(&json!({"x": -111.9, "y": 40.7})).unwrap();
        assert_eq!(p, json!({"type": "Point", "coordinates": [-111.9, 40.7]}));
        assert!(esri_to_geojson(&json!({"curveRings": []})).is_none());
        assert!(esri_to_geojson(&Value::Null).is_none());
    }
}
