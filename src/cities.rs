//! World-cities CSV import and the listing filter applied before clustering.
//!
//! Expected header:
//! `city,city_ascii,lat,lng,country,iso2,iso3,admin_name,capital,population,id`

use crate::error::Result;
use crate::point_store::Point;
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

pub const CITY_COLUMNS: usize = 11;
pub const MAX_ERROR_EXAMPLES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub id: u64,
    pub city: String,
    pub city_ascii: String,
    pub lat: f64,
    pub lng: f64,
    pub country: String,
    pub iso2: Option<String>,
    pub iso3: Option<String>,
    pub admin_name: Option<String>,
    pub capital: Option<String>,
    pub population: Option<u64>,
}

impl City {
    /// Clustering input; a missing population counts as zero.
    pub fn to_point(&self) -> Point {
        Point::new(
            self.id.to_string(),
            self.lat,
            self.lng,
            self.population.unwrap_or(0) as f64,
        )
        .with_name(self.city.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CityImport {
    /// One entry per id; a later row with the same id replaces the earlier one.
    pub cities: Vec<City>,
    /// Rows that replaced an earlier row with the same id.
    pub updated: usize,
    /// Rows that could not be parsed.
    pub skipped: usize,
    /// Data rows seen, header excluded.
    pub total_processed: usize,
    /// The first few parse errors, one line each.
    pub errors: Vec<String>,
}

impl CityImport {
    pub fn points(&self) -> Vec<Point> {
        self.cities.iter().map(City::to_point).collect()
    }
}

pub fn import_cities_file<P: AsRef<Path>>(path: P) -> Result<CityImport> {
    let path = path.as_ref();
    let import = import_cities(File::open(path)?)?;
    info!(
        "imported {} cities from {} ({} rows, {} updated, {} skipped)",
        import.cities.len(),
        path.display(),
        import.total_processed,
        import.updated,
        import.skipped
    );
    Ok(import)
}

/// Parses every data row of `reader`. Bad rows are counted and skipped; only
/// I/O and CSV framing failures abort the import.
pub fn import_cities<R: Read>(reader: R) -> Result<CityImport> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut import = CityImport::default();
    let mut positions: HashMap<u64, usize> = HashMap::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record?;
        let line = i + 1;
        import.total_processed += 1;

        match parse_city(&record, line) {
            Ok(city) => match positions.get(&city.id) {
                Some(&pos) => {
                    import.cities[pos] = city;
                    import.updated += 1;
                }
                None => {
                    positions.insert(city.id, import.cities.len());
                    import.cities.push(city);
                }
            },
            Err(message) => {
                import.skipped += 1;
                if import.errors.len() < MAX_ERROR_EXAMPLES {
                    import.errors.push(message);
                }
            }
        }
    }

    if import.skipped > 0 {
        warn!("skipped {} malformed city rows", import.skipped);
    }
    if import.updated > 0 {
        debug!("{} rows replaced an earlier row with the same id", import.updated);
    }
    Ok(import)
}

fn parse_city(record: &StringRecord, line: usize) -> std::result::Result<City, String> {
    if record.len() != CITY_COLUMNS {
        return Err(format!(
            "line {line}: expected {CITY_COLUMNS} columns, found {}",
            record.len()
        ));
    }
    let field = |i: usize| record.get(i).unwrap_or("");
    let optional = |i: usize| Some(field(i)).filter(|s| !s.is_empty()).map(str::to_string);

    let id = field(10)
        .parse::<u64>()
        .map_err(|_| format!("line {line}: invalid id: {}", field(10)))?;
    let lat = parse_coordinate(field(2))
        .ok_or_else(|| format!("line {line}: invalid latitude: {}", field(2)))?;
    let lng = parse_coordinate(field(3))
        .ok_or_else(|| format!("line {line}: invalid longitude: {}", field(3)))?;
    let population = field(9).parse::<u64>().ok();

    Ok(City {
        id,
        city: field(0).to_string(),
        city_ascii: field(1).to_string(),
        lat,
        lng,
        country: field(4).to_string(),
        iso2: optional(5).map(|s| s.to_uppercase()),
        iso3: optional(6).map(|s| s.to_uppercase()),
        admin_name: optional(7),
        capital: optional(8),
        population,
    })
}

fn parse_coordinate(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Listing filter: optional country substring (case-insensitive), then offset and limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CityFilter {
    pub country: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl CityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, city: &City) -> bool {
        match &self.country {
            Some(country) => city
                .country
                .to_lowercase()
                .contains(&country.to_lowercase()),
            None => true,
        }
    }

    pub fn apply<'a>(&self, cities: &'a [City]) -> Vec<&'a City> {
        cities
            .iter()
            .filter(|city| self.matches(city))
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}
