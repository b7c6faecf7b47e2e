use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

/// The four arithmetic operations, with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum Operation {
    Add = 1,
    Sub = 2,
    Mul = 3,
    Div = 4,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Sub => "sub",
            Operation::Mul => "mul",
            Operation::Div => "div",
        }
    }

    pub fn from_name(name: &str) -> Option<Operation> {
        match name {
            "add" => Some(Operation::Add),
            "sub" => Some(Operation::Sub),
            "mul" => Some(Operation::Mul),
            "div" => Some(Operation::Div),
            _ => None,
        }
    }
}

/// An arithmetic assignment issued to a client. The id is unique per active
///  session and never zero - clients use id 0 to ask for a (re)send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub id: u32,
    pub op: Operation,
    pub v1: i32,
    pub v2: i32,
    pub created_at: Instant,
}

impl Task {
    /// The reference answer. Arithmetic wraps modulo 2^32 (two's complement),
    ///  and division truncates toward zero; answers are compared bitwise on the
    ///  32-bit representation.
    pub fn eval(&self) -> i32 {
        match self.op {
            Operation::Add => self.v1.wrapping_add(self.v2),
            Operation::Sub => self.v1.wrapping_sub(self.v2),
            Operation::Mul => self.v1.wrapping_mul(self.v2),
            Operation::Div => self.v1.wrapping_div(self.v2),
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// Source of raw random integers for task generation. Injected so tests can run
///  against a deterministic sequence.
pub trait RandInt {
    fn next_int(&mut self) -> i32;
}

pub struct SeededRand {
    rng: SmallRng,
}

impl SeededRand {
    /// The production source, seeded once at startup.
    pub fn from_entropy() -> SeededRand {
        SeededRand {
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn from_seed(seed: u64) -> SeededRand {
        SeededRand {
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl RandInt for SeededRand {
    fn next_int(&mut self) -> i32 {
        self.rng.gen()
    }
}

/// Generates tasks with ids that are unique across the lifetime of the factory
///  (until u32 wrap-around) and never zero.
pub struct TaskFactory<R> {
    next_id: u32,
    rand: R,
}

impl<R: RandInt> TaskFactory<R> {
    pub fn new(rand: R) -> TaskFactory<R> {
        TaskFactory { next_id: 1, rand }
    }

    pub fn make_task(&mut self, now: Instant) -> Task {
        let id = self.next_id;
        self.next_id = match self.next_id.wrapping_add(1) {
            0 => 1,
            n => n,
        };

        let op = Operation::try_from((self.rand.next_int().rem_euclid(4) + 1) as u32)
            .expect("operation code is in 1..=4 by construction");

        let v1 = self.rand.next_int().rem_euclid(100);
        let v2 = if op == Operation::Div {
            loop {
                let v = self.rand.next_int().rem_euclid(100);
                if v != 0 {
                    break v;
                }
            }
        } else {
            self.rand.next_int().rem_euclid(100)
        };

        Task {
            id,
            op,
            v1,
            v2,
            created_at: now,
        }
    }

    /// Random non-zero task id for engines that do not hand out sequential ids
    ///  (the TCP engine mints one id per connection).
    pub fn random_task_id(&mut self) -> u32 {
        loop {
            let id = self.rand.next_int() as u32;
            if id != 0 {
                return id;
            }
        }
    }
}
