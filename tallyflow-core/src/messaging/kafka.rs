//! Transactional Kafka substrate.
//!
//! Every replica gets its own transactional producer, identified by
//! `<transactional_id_prefix>-<replica>`. Each egress destination is a topic. Kafka fences
//! off older producers with the same transactional id, so a restarted replica can never
//! commit alongside a zombie predecessor.
use std::{collections::HashMap, sync::Arc, time::Duration};

use bon::bon;
use rdkafka::{
    producer::{BaseProducer, BaseRecord, DefaultProducerContext, Producer},
    ClientConfig,
};
use tracing::{debug, warn};

use crate::types::ReplicaId;

use super::{
    EgressDestination, EgressProducer, Messaging, MessagingClient, Transaction, TransmissionError,
};

/// Kafka brokers used as the messaging substrate
pub struct KafkaMessaging {
    kafka_config: HashMap<String, String>,
    brokers: Vec<String>,
    transactional_id_prefix: String,
    timeout: Duration,
}

#[bon]
impl KafkaMessaging {
    /// Create a Kafka substrate. Every replica connects with its own transactional producer.
    #[builder]
    #[builder(on(String, into))]
    pub fn new(
        #[builder(field)] kafka_config: HashMap<String, String>,
        brokers: Vec<String>,
        transactional_id_prefix: String,
        /// Timeout for initializing, committing and aborting transactions
        #[builder(default = Duration::from_secs(30))]
        timeout: Duration,
    ) -> Self {
        Self {
            kafka_config,
            brokers,
            transactional_id_prefix,
            timeout,
        }
    }
}

impl<S: kafka_messaging_builder::State> KafkaMessagingBuilder<S> {
    /// Provide an additional config for the Kafka producers.
    /// Note that `bootstrap.servers` and `transactional.id` configs are
    /// ignored. Use the respective builder methods to supply these.
    pub fn conf(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kafka_config.insert(key.into(), value.into());
        self
    }
}

impl Messaging for KafkaMessaging {
    type Client = KafkaClient;

    fn connect(&self, replica: ReplicaId) -> Result<Self::Client, TransmissionError> {
        let mut conf = ClientConfig::new();
        for (k, v) in self.kafka_config.iter() {
            conf.set(k, v);
        }
        let transactional_id = format!("{}-{replica}", self.transactional_id_prefix);
        let producer: BaseProducer<DefaultProducerContext> = conf
            .set("bootstrap.servers", self.brokers.join(","))
            .set("transactional.id", &transactional_id)
            .create()
            .map_err(|e| TransmissionError::Connect(e.into()))?;
        producer
            .init_transactions(self.timeout)
            .map_err(|e| TransmissionError::Connect(e.into()))?;
        debug!(transactional_id, "Initialized transactional producer");
        Ok(KafkaClient {
            producer: Arc::new(producer),
            replica,
            timeout: self.timeout,
        })
    }
}

/// Transactional producer of one replica
pub struct KafkaClient {
    producer: Arc<BaseProducer<DefaultProducerContext>>,
    replica: ReplicaId,
    timeout: Duration,
}

impl MessagingClient for KafkaClient {
    type Transaction = KafkaTransaction;

    fn begin(&self) -> Result<Self::Transaction, TransmissionError> {
        self.producer
            .begin_transaction()
            .map_err(|e| TransmissionError::Begin(e.into()))?;
        Ok(KafkaTransaction {
            producer: Arc::clone(&self.producer),
            key: self.replica.to_be_bytes().to_vec(),
            timeout: self.timeout,
        })
    }
}

/// An open Kafka transaction
pub struct KafkaTransaction {
    producer: Arc<BaseProducer<DefaultProducerContext>>,
    key: Vec<u8>,
    timeout: Duration,
}

impl Transaction for KafkaTransaction {
    type Producer = KafkaTopicProducer;

    fn producer(
        &mut self,
        destination: &EgressDestination,
    ) -> Result<Self::Producer, TransmissionError> {
        Ok(KafkaTopicProducer {
            producer: Arc::clone(&self.producer),
            destination: destination.clone(),
            key: self.key.clone(),
        })
    }

    fn commit(self) -> Result<(), TransmissionError> {
        if let Err(e) = self.producer.commit_transaction(self.timeout) {
            if let Err(abort_err) = self.producer.abort_transaction(self.timeout) {
                warn!("Failed to abort transaction after failed commit: {abort_err:?}");
            }
            return Err(TransmissionError::Commit(e.into()));
        }
        Ok(())
    }

    fn abort(self) {
        if let Err(e) = self.producer.abort_transaction(self.timeout) {
            warn!("Failed to abort transaction: {e:?}");
        }
    }
}

/// Sends to a single topic within a [KafkaTransaction]
pub struct KafkaTopicProducer {
    producer: Arc<BaseProducer<DefaultProducerContext>>,
    destination: EgressDestination,
    key: Vec<u8>,
}

impl EgressProducer for KafkaTopicProducer {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransmissionError> {
        let record: BaseRecord<'_, [u8], [u8]> = BaseRecord::to(self.destination.name())
            .payload(payload)
            .key(self.key.as_slice());
        self.producer
            .send(record)
            .map_err(|(e, _)| TransmissionError::Send(self.destination.clone(), e.into()))?;
        self.producer.poll(Duration::default());
        Ok(())
    }
}
