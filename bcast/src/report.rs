/// Aggregate throughput of one run, as seen by the slowest rank.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Throughput {
    pub bytes: u64,
    pub seconds: f64,
}

const GIB: f64 = (1u64 << 30) as f64;

impl Throughput {
    pub fn gib(&self) -> f64 {
        self.bytes as f64 / GIB
    }

    pub fn gib_per_sec(&self) -> f64 {
        if self.seconds > 0.0 {
            self.gib() / self.seconds
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for Throughput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Transferred {:.2} GiB in {:.2} seconds ({:.2} GiB/s)",
            self.gib(),
            self.seconds,
            self.gib_per_sec()
        )
    }
}
