//! Blocks bind a queue and a reinforcement schedule to a condition list;
//! the handler walks a sequence of them across sessions.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::conditions::{Condition, Contract, Stimulus};
use crate::error::{ConfigError, Error, UsageError};
use crate::queues::{Queue, Selection};
use crate::reinforcement::{seeded_rng, ReinforcementSchedule};

/// A queue selection resolved against the block's conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct Drawn {
    pub block: usize,
    pub selection: Selection,
    pub contract: Contract,
    pub stimulus: Stimulus,
}

pub struct Block {
    index: usize,
    conditions: Vec<Condition>,
    queue: Box<dyn Queue>,
    reinforcement: Box<dyn ReinforcementSchedule>,
    /// Drawn but not yet completed; re-presented if the trial was abandoned.
    pending: Option<Drawn>,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("index", &self.index)
            .field("conditions", &self.conditions.len())
            .field("queue", &self.queue.name())
            .field("reinforcement", &self.reinforcement.name())
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl Block {
    pub fn new(
        conditions: Vec<Condition>,
        queue: Box<dyn Queue>,
        reinforcement: Box<dyn ReinforcementSchedule>,
    ) -> Result<Self, ConfigError> {
        if conditions.is_empty() {
            return Err(ConfigError::invalid("block.conditions", "at least one condition"));
        }
        Ok(Self {
            index: 0,
            conditions,
            queue,
            reinforcement,
            pending: None,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn reinforcement(&mut self) -> &mut dyn ReinforcementSchedule {
        self.reinforcement.as_mut()
    }

    /// The pending draw if one is outstanding, else the next queue selection.
    /// `None` once the queue is exhausted.
    pub fn draw(&mut self) -> Result<Option<Drawn>, Error> {
        if let Some(drawn) = &self.pending {
            return Ok(Some(drawn.clone()));
        }
        let Some(selection) = self.queue.next()? else {
            return Ok(None);
        };
        let len = self.conditions.len();
        let condition = self
            .conditions
            .get_mut(selection.condition)
            .ok_or(UsageError::ConditionOutOfRange {
                index: selection.condition,
                len,
            })?;
        let stimulus = match selection.item {
            Some(item) => condition.get_at(item)?,
            None => condition.get().ok_or_else(|| {
                UsageError::Invalid(format!("condition {} has no stimuli", condition.name()))
            })?,
        };
        let drawn = Drawn {
            block: self.index,
            contract: condition.contract().clone(),
            stimulus,
            selection,
        };
        self.pending = Some(drawn.clone());
        Ok(Some(drawn))
    }

    /// Report the outcome of the pending draw to the queue.
    pub fn complete(&mut self, correct: bool, no_response: bool) -> Result<(), Error> {
        if self.pending.take().is_none() {
            return Err(UsageError::Invalid(format!(
                "block {}: completed without a pending draw",
                self.index
            ))
            .into());
        }
        self.queue.update(correct, no_response)
    }
}

/// Builds a fresh block each time the sequence reaches it.
pub trait BlockFactory: Send {
    fn build(&mut self) -> Result<Block, Error>;
}

impl<F> BlockFactory for F
where
    F: FnMut() -> Result<Block, Error> + Send,
{
    fn build(&mut self) -> Result<Block, Error> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOrder {
    #[default]
    Sequential,
    Random,
}

pub struct BlockHandler {
    factories: Vec<Box<dyn BlockFactory>>,
    order: BlockOrder,
    sequence: Vec<usize>,
    pos: usize,
    current: Option<Block>,
    rng: StdRng,
}

impl std::fmt::Debug for BlockHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHandler")
            .field("blocks", &self.factories.len())
            .field("order", &self.order)
            .field("sequence", &self.sequence)
            .field("pos", &self.pos)
            .field("current", &self.current)
            .finish()
    }
}

impl BlockHandler {
    pub fn new(
        factories: Vec<Box<dyn BlockFactory>>,
        order: BlockOrder,
        seed: Option<u64>,
    ) -> Result<Self, ConfigError> {
        if factories.is_empty() {
            return Err(ConfigError::invalid("blocks", "at least one block"));
        }
        let mut handler = Self {
            sequence: Vec::new(),
            factories,
            order,
            pos: 0,
            current: None,
            rng: seeded_rng(seed),
        };
        handler.new_pass();
        Ok(handler)
    }

    fn new_pass(&mut self) {
        self.sequence = (0..self.factories.len()).collect();
        if self.order == BlockOrder::Random {
            self.sequence.shuffle(&mut self.rng);
        }
        self.pos = 0;
    }

    /// Whether every block of the current pass has been used up.
    pub fn finished(&self) -> bool {
        self.current.is_none() && self.pos >= self.sequence.len()
    }

    /// Called at session start. A partially consumed block is resumed; a
    /// finished sequence starts over with freshly built blocks.
    pub fn begin_session(&mut self) {
        if self.finished() {
            info!("block sequence finished, starting over");
            self.new_pass();
        }
    }

    pub fn current(&mut self) -> Option<&mut Block> {
        self.current.as_mut()
    }

    /// Next draw, moving through blocks as they exhaust. `None` once the whole
    /// pass is consumed.
    pub fn draw(&mut self) -> Result<Option<Drawn>, Error> {
        loop {
            let block = match self.current {
                Some(ref mut block) => block,
                None => {
                    let Some(&which) = self.sequence.get(self.pos) else {
                        return Ok(None);
                    };
                    let mut block = self.factories[which].build()?;
                    block.index = self.pos;
                    info!(block = self.pos, queue = block.queue_name(), "block start");
                    self.current.insert(block)
                }
            };
            if let Some(drawn) = block.draw()? {
                return Ok(Some(drawn));
            }
            info!(block = block.index, "block exhausted");
            self.current = None;
            self.pos += 1;
        }
    }
}
