use crate::core::ledger::JoinedTable;
use crate::io::tile_reader::reproject_geometry;
use crate::types::{Crs, Grade, VerdureError, VerdureResult, Zone};
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject, JsonValue};
use std::path::Path;

/// Polygon zones sharing one CRS
#[derive(Debug, Clone)]
pub struct ZoneLayer {
    pub zones: Vec<Zone>,
    pub crs: Crs,
}

fn property_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn to_multipolygon(geometry: geo::Geometry<f64>) -> Option<geo::MultiPolygon<f64>> {
    match geometry {
        geo::Geometry::Polygon(p) => Some(geo::MultiPolygon(vec![p])),
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        _ => None,
    }
}

impl ZoneLayer {
    /// Load a GeoJSON FeatureCollection.
    ///
    /// `id_field` must be present on every feature; a missing or unknown
    /// `grade_field` value leaves the grade unset.
    pub fn from_geojson_str(text: &str, id_field: &str, grade_field: Option<&str>, crs: Crs) -> VerdureResult<Self> {
        let geojson: GeoJson = text
            .parse()
            .map_err(|e| VerdureError::InvalidFormat(format!("GeoJSON parse error: {}", e)))?;
        let collection = match geojson {
            GeoJson::FeatureCollection(fc) => fc,
            _ => {
                return Err(VerdureError::InvalidFormat(
                    "Zone layer must be a FeatureCollection".to_string(),
                ))
            }
        };

        let mut zones = Vec::with_capacity(collection.features.len());
        for (i, feature) in collection.features.into_iter().enumerate() {
            let id = feature.property(id_field).and_then(property_text).ok_or_else(|| {
                VerdureError::InvalidFormat(format!("Feature {} has no usable '{}' property", i, id_field))
            })?;

            let grade = grade_field
                .and_then(|field| feature.property(field))
                .and_then(property_text)
                .and_then(|label| Grade::parse(&label));

            let Some(geometry) = feature.geometry else {
                log::warn!("Zone {} has no geometry, skipping", id);
                continue;
            };
            let geometry = geo::Geometry::<f64>::try_from(geometry.value)
                .map_err(|e| VerdureError::InvalidFormat(format!("Zone {}: {}", id, e)))?;
            let geometry = to_multipolygon(geometry)
                .ok_or_else(|| VerdureError::InvalidFormat(format!("Zone {} is not polygonal", id)))?;

            zones.push(Zone { id, grade, geometry });
        }

        log::info!("Loaded {} zones in {}", zones.len(), crs);
        Ok(Self { zones, crs })
    }

    pub fn from_geojson_file<P: AsRef<Path>>(
        path: P,
        id_field: &str,
        grade_field: Option<&str>,
        crs: Crs,
    ) -> VerdureResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_geojson_str(&text, id_field, grade_field, crs)
    }

    /// Same zones with geometries in `target`
    pub fn reprojected(&self, target: &Crs) -> VerdureResult<ZoneLayer> {
        let zones = self
            .zones
            .iter()
            .map(|zone| {
                Ok(Zone {
                    id: zone.id.clone(),
                    grade: zone.grade,
                    geometry: reproject_geometry(&zone.geometry, &self.crs, target)?,
                })
            })
            .collect::<VerdureResult<Vec<_>>>()?;
        Ok(ZoneLayer {
            zones,
            crs: target.clone(),
        })
    }

    pub fn get(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }
}

/// Joined zones as GeoJSON features carrying the ledger columns and grade
pub fn joined_to_geojson(table: &JoinedTable) -> GeoJson {
    let features = table
        .rows
        .iter()
        .map(|row| {
            let mut properties = JsonObject::new();
            properties.insert("zone".to_string(), JsonValue::from(row.zone.id.clone()));
            properties.insert("grade".to_string(), JsonValue::from(row.grade.to_string()));
            properties.insert("total_pixels".to_string(), JsonValue::from(row.record.total_pixels));
            properties.insert("frac_veg".to_string(), JsonValue::from(row.record.frac_veg));
            properties.insert("mean_patch_size".to_string(), JsonValue::from(row.record.mean_patch_size));
            properties.insert("edge_density".to_string(), JsonValue::from(row.record.edge_density));

            Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&row.zone.geometry))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    GeoJson::FeatureCollection(FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    })
}

pub fn write_joined_geojson<P: AsRef<Path>>(path: P, table: &JoinedTable) -> VerdureResult<()> {
    std::fs::write(path.as_ref(), joined_to_geojson(table).to_string())?;
    log::info!("Wrote {} joined zones to {}", table.rows.len(), path.as_ref().display());
    Ok(())
}
