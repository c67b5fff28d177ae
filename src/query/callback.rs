//! Query result callbacks
//!
//! Results are pushed: the runner announces each series, streams its
//! points and finalizes exactly once. Sink failures are io errors; the
//! runner records them and keeps going with the remaining batches.

use std::collections::BTreeMap;
use std::io;

use crate::datapoint::DataPoint;

/// Consumer of a streamed query result
///
/// Callbacks are driven sequentially by one runner and never shared
/// across threads, but they ride inside spawned futures, hence `Send`.
pub trait QueryCallback: Send {
    /// A new series begins; every following point belongs to it until the
    /// next call
    fn start_data_point_set(
        &mut self,
        data_type: &str,
        tags: &BTreeMap<String, String>,
    ) -> io::Result<()>;

    fn add_data_point(&mut self, point: DataPoint) -> io::Result<()>;

    /// Called exactly once, after the last batch
    fn end_data_points(&mut self) -> io::Result<()>;
}

/// One streamed series
#[derive(Debug, Clone)]
pub struct CollectedSeries {
    pub data_type: String,
    pub tags: BTreeMap<String, String>,
    pub points: Vec<DataPoint>,
}

/// Collects streamed series into memory
#[derive(Debug, Default)]
pub struct SeriesCollector {
    pub series: Vec<CollectedSeries>,
    pub finished: bool,
}

impl SeriesCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// All points across series, in arrival order
    pub fn points(&self) -> impl Iterator<Item = &DataPoint> {
        self.series.iter().flat_map(|s| s.points.iter())
    }
}

impl QueryCallback for SeriesCollector {
    fn start_data_point_set(
        &mut self,
        data_type: &str,
        tags: &BTreeMap<String, String>,
    ) -> io::Result<()> {
        self.series.push(CollectedSeries {
            data_type: data_type.to_string(),
            tags: tags.clone(),
            points: Vec::new(),
        });
        Ok(())
    }

    fn add_data_point(&mut self, point: DataPoint) -> io::Result<()> {
        match self.series.last_mut() {
            Some(series) => {
                series.points.push(point);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "data point before any series was started",
            )),
        }
    }

    fn end_data_points(&mut self) -> io::Result<()> {
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_groups_by_series() {
        let mut collector = SeriesCollector::new();
        let tags = BTreeMap::new();

        collector.start_data_point_set("kairos_long", &tags).unwrap();
        collector
            .add_data_point(DataPoint::new(1, "kairos_long", vec![1]))
            .unwrap();
        collector
            .add_data_point(DataPoint::new(2, "kairos_long", vec![2]))
            .unwrap();
        collector.start_data_point_set("kairos_double", &tags).unwrap();
        collector
            .add_data_point(DataPoint::new(3, "kairos_double", vec![3]))
            .unwrap();
        collector.end_data_points().unwrap();

        assert_eq!(collector.series.len(), 2);
        assert_eq!(collector.series[0].points.len(), 2);
        assert_eq!(collector.series[1].points.len(), 1);
        assert!(collector.finished);
        assert_eq!(collector.points().count(), 3);
    }

    #[test]
    fn test_point_without_series_is_an_error() {
        let mut collector = SeriesCollector::new();
        assert!(collector
            .add_data_point(DataPoint::new(1, "kairos_long", vec![]))
            .is_err());
    }
}
