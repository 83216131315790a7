use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Utc};

/// One of the four cities with daily-high markets.
///
/// `utc_offset_secs` is the city's *standard* time offset. Settlement days
/// are measured in local standard time year-round, never daylight time, so
/// a fixed offset is the correct model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct City {
    pub code: &'static str,
    pub name: &'static str,
    /// Observing station whose high settles the market.
    pub station: &'static str,
    /// Exchange series ticker for the daily-high event family.
    pub series_ticker: &'static str,
    /// NWS office that issues the city's CLI climate report.
    pub cli_office: &'static str,
    pub lat: f64,
    pub lon: f64,
    utc_offset_secs: i32,
}

pub const CITIES: &[City] = &[
    City {
        code: "NYC",
        name: "New York City",
        station: "KNYC",
        series_ticker: "KXHIGHNY",
        cli_office: "OKX",
        lat: 40.7790,
        lon: -73.9692,
        utc_offset_secs: -5 * 3600,
    },
    City {
        code: "CHI",
        name: "Chicago",
        station: "KMDW",
        series_ticker: "KXHIGHCHI",
        cli_office: "LOT",
        lat: 41.7861,
        lon: -87.7522,
        utc_offset_secs: -6 * 3600,
    },
    City {
        code: "MIA",
        name: "Miami",
        station: "KMIA",
        series_ticker: "KXHIGHMIA",
        cli_office: "MFL",
        lat: 25.7906,
        lon: -80.3164,
        utc_offset_secs: -5 * 3600,
    },
    City {
        code: "AUS",
        name: "Austin",
        station: "KAUS",
        series_ticker: "KXHIGHAUS",
        cli_office: "EWX",
        lat: 30.1831,
        lon: -97.6799,
        utc_offset_secs: -6 * 3600,
    },
];

pub fn city_by_code(code: &str) -> Option<&'static City> {
    CITIES.iter().find(|c| c.code == code)
}

impl City {
    pub fn standard_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).expect("static offset in range")
    }

    /// Current date in the city's standard-time frame.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.standard_offset()).date_naive()
    }

    /// Event ticker for the daily-high event on `date`, e.g. `KXHIGHNY-26FEB18`.
    pub fn event_ticker(&self, date: NaiveDate) -> String {
        format!(
            "{}-{}",
            self.series_ticker,
            date.format("%y%b%d").to_string().to_uppercase()
        )
    }
}

/// Meteorological season used for error-distribution lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Fall,
}

impl Season {
    pub fn from_month(month: u32) -> Season {
        match month {
            12 | 1 | 2 => Season::Winter,
            3 | 4 | 5 => Season::Spring,
            6 | 7 | 8 => Season::Summer,
            _ => Season::Fall,
        }
    }

    pub fn from_date(date: NaiveDate) -> Season {
        Season::from_month(date.month())
    }

    pub fn months(&self) -> [u32; 3] {
        match self {
            Season::Winter => [12, 1, 2],
            Season::Spring => [3, 4, 5],
            Season::Summer => [6, 7, 8],
            Season::Fall => [9, 10, 11],
        }
    }
}

/// Celsius to Fahrenheit. Everything stored downstream is Fahrenheit.
pub fn c_to_f(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

pub fn f_to_c(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_city_lookup() {
        assert_eq!(city_by_code("NYC").unwrap().station, "KNYC");
        assert_eq!(city_by_code("AUS").unwrap().cli_office, "EWX");
        assert!(city_by_code("LAX").is_none());
    }

    #[test]
    fn test_event_ticker_format() {
        let nyc = city_by_code("NYC").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        assert_eq!(nyc.event_ticker(date), "KXHIGHNY-26FEB18");
    }

    #[test]
    fn test_local_date_standard_time() {
        let chi = city_by_code("CHI").unwrap();
        // 04:30 UTC is 22:30 the previous day in CST (UTC-6)
        let now = Utc.with_ymd_and_hms(2026, 7, 2, 4, 30, 0).unwrap();
        assert_eq!(
            chi.local_date(now),
            NaiveDate::from_ymd_opt(2026, 7, 1).unwrap()
        );
        // Offset stays -6 in July: standard time, not daylight time
        let nyc = city_by_code("NYC").unwrap();
        assert_eq!(
            nyc.local_date(now),
            NaiveDate::from_ymd_opt(2026, 7, 1).unwrap()
        );
    }

    #[test]
    fn test_season_boundaries() {
        assert_eq!(Season::from_month(12), Season::Winter);
        assert_eq!(Season::from_month(2), Season::Winter);
        assert_eq!(Season::from_month(3), Season::Spring);
        assert_eq!(Season::from_month(8), Season::Summer);
        assert_eq!(Season::from_month(11), Season::Fall);
    }

    #[test]
    fn test_unit_round_trip() {
        assert!((c_to_f(0.0) - 32.0).abs() < 1e-12);
        assert!((c_to_f(100.0) - 212.0).abs() < 1e-12);
        for f in [-40.0, 0.0, 32.0, 53.4, 98.6, 110.0] {
            assert!((c_to_f(f_to_c(f)) - f).abs() < 1e-9);
        }
    }
}
