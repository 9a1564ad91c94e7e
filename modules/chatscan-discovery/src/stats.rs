/// Counters for one discovery run.
#[derive(Debug, Default, Clone)]
pub struct DiscoveryStats {
    pub batches: u32,
    pub batch_errors: u32,
    pub raw_entities: usize,
    pub normalized_entities: usize,
    pub dropped_entities: usize,
    pub repeated_observations: usize,
    pub published_entities: usize,
    pub anomalies: usize,
}

impl std::fmt::Display for DiscoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Chat Discovery Complete ===")?;
        writeln!(f, "Batches:            {}", self.batches)?;
        writeln!(f, "Batch errors:       {}", self.batch_errors)?;
        writeln!(f, "Raw chats:          {}", self.raw_entities)?;
        writeln!(f, "Normalized:         {}", self.normalized_entities)?;
        writeln!(f, "Dropped (no id):    {}", self.dropped_entities)?;
        writeln!(f, "Repeat sightings:   {}", self.repeated_observations)?;
        writeln!(f, "Published:          {}", self.published_entities)?;
        write!(f, "Anomalies:          {}", self.anomalies)
    }
}
