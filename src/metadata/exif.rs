// EXIF extraction for still images

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use exif::{In, Reader, Tag, Value};
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExifData {
    pub date_taken: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub lens_model: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl ExifData {
    /// Copy present fields into a metadata extras map
    pub fn merge_into(&self, extra: &mut Map<String, JsonValue>) {
        let text_fields = [
            ("date_taken", &self.date_taken),
            ("camera_make", &self.camera_make),
            ("camera_model", &self.camera_model),
            ("lens_model", &self.lens_model),
        ];
        for (key, value) in text_fields {
            if let Some(v) = value {
                extra.insert(key.to_string(), JsonValue::from(v.clone()));
            }
        }
        if let (Some(lat), Some(lon)) = (self.latitude, self.longitude) {
            extra.insert("latitude".to_string(), JsonValue::from(lat));
            extra.insert("longitude".to_string(), JsonValue::from(lon));
        }
    }
}

/// Read EXIF from a file. Files without EXIF yield None.
pub fn extract(path: &Path) -> Option<ExifData> {
    let file = File::open(path).ok()?;
    let mut bufreader = BufReader::new(&file);
    let reader = Reader::new().read_from_container(&mut bufreader).ok()?;

    let text = |tag: Tag| {
        reader
            .get_field(tag, In::PRIMARY)
            .map(|f| f.display_value().to_string().trim_matches('"').trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let latitude = gps_coordinate(&reader, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S");
    let longitude = gps_coordinate(&reader, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W");

    Some(ExifData {
        date_taken: text(Tag::DateTimeOriginal).or_else(|| text(Tag::DateTime)),
        camera_make: text(Tag::Make),
        camera_model: text(Tag::Model),
        lens_model: text(Tag::LensModel),
        latitude,
        longitude,
    })
}

/// Degrees/minutes/seconds rationals to signed decimal degrees
fn gps_coordinate(reader: &exif::Exif, value_tag: Tag, ref_tag: Tag, negative_ref: &str) -> Option<f64> {
    let field = reader.get_field(value_tag, In::PRIMARY)?;
    let parts = match &field.value {
        Value::Rational(parts) if parts.len() >= 3 => parts,
        _ => return None,
    };
    let degrees = dms_to_degrees(parts[0].to_f64(), parts[1].to_f64(), parts[2].to_f64());

    let negative = reader
        .get_field(ref_tag, In::PRIMARY)
        .map(|f| f.display_value().to_string().contains(negative_ref))
        .unwrap_or(false);

    Some(if negative { -degrees } else { degrees })
}

fn dms_to_degrees(d: f64, m: f64, s: f64) -> f64 {
    d + m / 60.0 + s / 3600.0
}
