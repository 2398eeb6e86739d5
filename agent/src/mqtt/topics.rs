//! MQTT topic definitions

/// MQTT topic patterns
pub struct Topics;

impl Topics {
    /// All events of a job
    pub fn job_events(job_id: &str) -> String {
        format!("upgrade/job/{}/events", job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_generation() {
        assert_eq!(Topics::job_events("job-123"), "upgrade/job/job-123/events");
    }
}
