use crate::money::Amount;
use crate::params::ConsensusParams;

/// Block reward before fees, halving every `subsidy_halving_interval` blocks.
pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    if height < 0 || params.subsidy_halving_interval <= 0 {
        return params.initial_subsidy;
    }
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    params.initial_subsidy >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::COIN;
    use crate::params::{consensus_params, Network};

    #[test]
    fn halves_on_schedule() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(block_subsidy(0, &params), 50 * COIN);
        assert_eq!(block_subsidy(209_999, &params), 50 * COIN);
        assert_eq!(block_subsidy(210_000, &params), 25 * COIN);
        assert_eq!(block_subsidy(420_000, &params), 25 * COIN / 2);
    }

    #[test]
    fn runs_out_after_sixty_four_halvings() {
        let params = consensus_params(Network::Regtest);
        assert_eq!(block_subsidy(150 * 64, &params), 0);
        assert!(block_subsidy(150 * 32, &params) < COIN);
    }
}
