use std::fmt;

use chrono::{DateTime, Utc};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// A record as read from the broker. Immutable once created by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    partition: Partition,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    /// Milliseconds since the unix epoch, when the broker reported one
    timestamp: Option<i64>,
}

impl Record {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        timestamp: Option<i64>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            payload,
            timestamp,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn key_str(&self) -> Option<&str> {
        self.key().and_then(|k| std::str::from_utf8(k).ok())
    }

    pub fn payload_str(&self) -> Option<&str> {
        self.payload().and_then(|p| std::str::from_utf8(p).ok())
    }

    pub fn timestamp_millis(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp.and_then(DateTime::from_timestamp_millis)
    }

    /// Deserialize the payload as JSON. A record without payload yields `None`.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payload().map(serde_json::from_slice).transpose()
    }
}

/// A record to be sent by a producer client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    topic: String,
    partition: Option<i32>,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    timestamp: Option<i64>,
    headers: Vec<(String, Vec<u8>)>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            payload: None,
            timestamp: None,
            headers: Vec::new(),
        }
    }

    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic).with_payload(serde_json::to_vec(value)?))
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_timestamp(mut self, timestamp_millis: i64) -> Self {
        self.timestamp = Some(timestamp_millis);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> Option<i32> {
        self.partition
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn timestamp_millis(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn headers(&self) -> &[(String, Vec<u8>)] {
        &self.headers
    }

    /// Approximate wire size used for the record size limit
    pub fn size_bytes(&self) -> usize {
        self.key.as_ref().map_or(0, Vec::len)
            + self.payload.as_ref().map_or(0, Vec::len)
            + self
                .headers
                .iter()
                .map(|(name, value)| name.len() + value.len())
                .sum::<usize>()
    }
}

/// Broker confirmation of a produced record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAck {
    pub partition: Partition,
    pub offset: i64,
}

/// Position handed to the broker client when committing a partition.
/// `next_offset` is the first offset that has NOT been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPosition {
    pub next_offset: i64,
    pub generation: u64,
}

/// Where a manually assigned partition starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Group committed offset, falling back to the auto offset reset policy
    Committed,
    Offset(i64),
    /// First record whose timestamp (millis) is at or after the given one
    Timestamp(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStart {
    pub partition: Partition,
    pub start: StartPosition,
}

impl PartitionStart {
    pub fn committed(partition: Partition) -> Self {
        Self {
            partition,
            start: StartPosition::Committed,
        }
    }

    pub fn at_offset(partition: Partition, offset: i64) -> Self {
        Self {
            partition,
            start: StartPosition::Offset(offset),
        }
    }

    pub fn at_timestamp(partition: Partition, timestamp_millis: i64) -> Self {
        Self {
            partition,
            start: StartPosition::Timestamp(timestamp_millis),
        }
    }
}

/// What a source reads: group managed topics or a pattern, or a fixed assignment
#[derive(Debug, Clone)]
pub enum Subscription {
    Topics(Vec<String>),
    Pattern(Regex),
    Assignment(Vec<PartitionStart>),
}

impl Subscription {
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Topics(topics.into_iter().map(Into::into).collect())
    }

    pub fn pattern(pattern: &str) -> Result<Self, BrokerError> {
        Regex::new(pattern)
            .map(Self::Pattern)
            .map_err(|e| BrokerError::InvalidSubscription(format!("{pattern}: {e}")))
    }

    pub fn assignment<I>(partitions: I) -> Self
    where
        I: IntoIterator<Item = Partition>,
    {
        Self::Assignment(partitions.into_iter().map(PartitionStart::committed).collect())
    }

    pub fn assignment_with_offset(partition: Partition, offset: i64) -> Self {
        Self::Assignment(vec![PartitionStart::at_offset(partition, offset)])
    }

    pub fn assignment_offsets_for_times<I>(partitions: I) -> Self
    where
        I: IntoIterator<Item = (Partition, i64)>,
    {
        Self::Assignment(
            partitions
                .into_iter()
                .map(|(p, ts)| PartitionStart::at_timestamp(p, ts))
                .collect(),
        )
    }

    /// Group subscriptions are subject to rebalancing, manual assignments are not
    pub fn is_group_managed(&self) -> bool {
        !matches!(self, Self::Assignment(_))
    }

    pub fn matches_topic(&self, topic: &str) -> bool {
        match self {
            Self::Topics(topics) => topics.iter().any(|t| t == topic),
            Self::Pattern(regex) => regex.is_match(topic),
            Self::Assignment(starts) => starts.iter().any(|s| s.partition.topic() == topic),
        }
    }
}
