//! Decides the order in which the selected ports of every target are probed.
use crate::input::ScanOrder;
use rand::seq::SliceRandom;

/// Ordered port list used when expanding targets into scan units.
///
/// Excluded ports are removed and duplicates collapsed when the
/// strategy is picked, so every port appears exactly once.
#[derive(Debug, Clone)]
pub enum PortStrategy {
    Serial(Vec<u16>),
    Random(Vec<u16>),
}

impl PortStrategy {
    pub fn pick(ports: &[u16], exclude_ports: &[u16], order: ScanOrder) -> Self {
        let mut ports: Vec<u16> = ports
            .iter()
            .copied()
            .filter(|port| !exclude_ports.contains(port))
            .collect();
        ports.sort_unstable();
        ports.dedup();

        match order {
            ScanOrder::Serial => Self::Serial(ports),
            ScanOrder::Random => {
                let mut rng = rand::rng();
                ports.shuffle(&mut rng);
                Self::Random(ports)
            }
        }
    }

    pub fn ordered_iter(&self) -> impl Iterator<Item = u16> + '_ {
        match self {
            Self::Serial(ports) | Self::Random(ports) => ports.iter().copied(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Serial(ports) | Self::Random(ports) => ports.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
