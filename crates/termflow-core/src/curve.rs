//! The trading curve.
//!
//! Trades are priced against the invariant
//!
//! `k = (c / mu) * (mu * ze)^(1 - t) + y^(1 - t)`
//!
//! where `ze` is the effective share reserves, `y` the bond reserves, `c` the
//! current vault share price, `mu` the initial vault share price, and `t` the
//! time-stretch exponent. Every solver here picks its rounding direction so
//! that the pool never rounds in the trader's favor: bonds and shares leaving
//! the pool are underestimated, shares owed to the pool are overestimated.

use termflow_math::{FixedPoint, I256};

use crate::errors::{CoreError, CoreResult};

/// `ze = z - zeta`. A negative adjustment increases the effective reserves.
pub fn effective_share_reserves(z: FixedPoint, zeta: I256) -> FixedPoint {
    FixedPoint::from(I256::from(z) - zeta)
}

/// The pool's spot price of a bond in base, `((mu * ze) / y)^t`. At or below
/// one for any solvent reserve state.
pub fn spot_price(ze: FixedPoint, y: FixedPoint, mu: FixedPoint, t: FixedPoint) -> FixedPoint {
    ((mu * ze) / y).pow(t)
}

/// The curve invariant `k`, overestimated.
pub fn k_up(
    ze: FixedPoint,
    y: FixedPoint,
    c: FixedPoint,
    mu: FixedPoint,
    t: FixedPoint,
) -> FixedPoint {
    let one = FixedPoint::one();
    c.mul_div_up((mu.mul_up(ze)).pow(one - t), mu) + y.pow(one - t)
}

/// The curve invariant `k`, underestimated.
pub fn k_down(
    ze: FixedPoint,
    y: FixedPoint,
    c: FixedPoint,
    mu: FixedPoint,
    t: FixedPoint,
) -> FixedPoint {
    let one = FixedPoint::one();
    c.mul_div_down((mu * ze).pow(one - t), mu) + y.pow(one - t)
}

/// Raises to `1 / (1 - t)`, choosing the exponent rounding that makes the
/// result larger.
fn invert_exponent_up(value: FixedPoint, t: FixedPoint) -> FixedPoint {
    let one = FixedPoint::one();
    if value >= one {
        value.pow(one.div_up(one - t))
    } else {
        value.pow(one / (one - t))
    }
}

/// Raises to `1 / (1 - t)`, choosing the exponent rounding that makes the
/// result smaller.
fn invert_exponent_down(value: FixedPoint, t: FixedPoint) -> FixedPoint {
    let one = FixedPoint::one();
    if value >= one {
        value.pow(one / (one - t))
    } else {
        value.pow(one.div_up(one - t))
    }
}

/// Bonds received for `dz` shares in, underestimated.
pub fn bonds_out_given_shares_in_down(
    ze: FixedPoint,
    y: FixedPoint,
    c: FixedPoint,
    mu: FixedPoint,
    t: FixedPoint,
    dz: FixedPoint,
) -> CoreResult<FixedPoint> {
    let one = FixedPoint::one();

    // Rounding k up makes the subtrahend larger and the output smaller.
    let k = k_up(ze, y, c, mu, t);

    // (c / mu) * (mu * (ze + dz))^(1 - t), rounded down.
    let mut ze_term = (mu * (ze + dz)).pow(one - t);
    ze_term = c.mul_div_down(ze_term, mu);

    if k < ze_term {
        return Err(CoreError::InsufficientLiquidity);
    }
    let y_term = invert_exponent_up(k - ze_term, t);

    // dy = y - (k - (c / mu) * (mu * (ze + dz))^(1 - t))^(1 / (1 - t))
    if y < y_term {
        return Err(CoreError::InsufficientLiquidity);
    }
    Ok(y - y_term)
}

/// Shares owed for `dy` bonds out, overestimated.
pub fn shares_in_given_bonds_out_up(
    ze: FixedPoint,
    y: FixedPoint,
    c: FixedPoint,
    mu: FixedPoint,
    t: FixedPoint,
    dy: FixedPoint,
) -> CoreResult<FixedPoint> {
    let one = FixedPoint::one();
    let k = k_up(ze, y, c, mu, t);

    if y < dy {
        return Err(CoreError::InsufficientLiquidity);
    }
    let y_term = (y - dy).pow(one - t);

    if k < y_term {
        return Err(CoreError::InsufficientLiquidity);
    }
    let mut ze_term = invert_exponent_up((k - y_term).mul_div_up(mu, c), t);
    ze_term = ze_term.div_up(mu);

    // dz = (((k - (y - dy)^(1 - t)) / (c / mu))^(1 / (1 - t))) / mu - ze
    if ze_term < ze {
        return Err(CoreError::InsufficientLiquidity);
    }
    Ok(ze_term - ze)
}

/// Shares owed for `dy` bonds out, underestimated.
pub fn shares_in_given_bonds_out_down(
    ze: FixedPoint,
    y: FixedPoint,
    c: FixedPoint,
    mu: FixedPoint,
    t: FixedPoint,
    dy: FixedPoint,
) -> CoreResult<FixedPoint> {
    let one = FixedPoint::one();
    let k = k_down(ze, y, c, mu, t);

    if y < dy {
        return Err(CoreError::InsufficientLiquidity);
    }
    let y_term = (y - dy).pow(one - t);

    if k < y_term {
        return Err(CoreError::InsufficientLiquidity);
    }
    let mut ze_term = invert_exponent_down((k - y_term).mul_div_down(mu, c), t);
    ze_term = ze_term / mu;

    if ze_term < ze {
        return Err(CoreError::InsufficientLiquidity);
    }
    Ok(ze_term - ze)
}

/// Shares received for `dy` bonds in, underestimated.
pub fn shares_out_given_bonds_in_down(
    ze: FixedPoint,
    y: FixedPoint,
    c: FixedPoint,
    mu: FixedPoint,
    t: FixedPoint,
    dy: FixedPoint,
) -> CoreResult<FixedPoint> {
    let one = FixedPoint::one();
    let k = k_up(ze, y, c, mu, t);

    let y_term = (y + dy).pow(one - t);
    if k < y_term {
        return Err(CoreError::InsufficientLiquidity);
    }

    // Rounding the new effective reserves up underestimates the payout.
    let mut ze_term = invert_exponent_up((k - y_term).mul_div_up(mu, c), t);
    ze_term = ze_term.div_up(mu);

    // dz = ze - ((k - (y + dy)^(1 - t)) / (c / mu))^(1 / (1 - t)) / mu
    if ze > ze_term {
        Ok(ze - ze_term)
    } else {
        Ok(FixedPoint::zero())
    }
}

/// Share payment that buys every bond the curve can sell before the spot
/// price reaches one, underestimated.
pub fn max_buy_shares_in(
    ze: FixedPoint,
    y: FixedPoint,
    c: FixedPoint,
    mu: FixedPoint,
    t: FixedPoint,
) -> CoreResult<FixedPoint> {
    // At a spot price of one, mu * ze' = y', which collapses the invariant to
    // k = ((c / mu) + 1) * (mu * ze')^(1 - t).
    let one = FixedPoint::one();
    let k = k_down(ze, y, c, mu, t);
    let mut optimal_ze = k.div_down(c.div_up(mu) + one);
    optimal_ze = invert_exponent_up(optimal_ze, t);
    optimal_ze = optimal_ze.div_down(mu);

    if optimal_ze >= ze {
        Ok(optimal_ze - ze)
    } else {
        Err(CoreError::InsufficientLiquidity)
    }
}

/// Bonds out for the maximal buy, underestimated.
pub fn max_buy_bonds_out(
    ze: FixedPoint,
    y: FixedPoint,
    c: FixedPoint,
    mu: FixedPoint,
    t: FixedPoint,
) -> CoreResult<FixedPoint> {
    // Same boundary as `max_buy_shares_in`, solved for the bond reserves:
    // y' = (k / ((c / mu) + 1))^(1 / (1 - t)).
    let one = FixedPoint::one();
    let k = k_up(ze, y, c, mu, t);
    let mut optimal_y = k.div_up(c / mu + one);
    optimal_y = invert_exponent_up(optimal_y, t);

    if y >= optimal_y {
        Ok(y - optimal_y)
    } else {
        Err(CoreError::InsufficientLiquidity)
    }
}

/// Bonds the curve can absorb before the share reserves hit `z_min`,
/// underestimated.
pub fn max_sell_bonds_in(
    ze: FixedPoint,
    y: FixedPoint,
    c: FixedPoint,
    mu: FixedPoint,
    t: FixedPoint,
    zeta: I256,
    mut z_min: FixedPoint,
) -> CoreResult<FixedPoint> {
    // A negative share adjustment raises the floor on the effective reserves
    // so the true share reserves never fall below z_min.
    if zeta < I256::zero() {
        z_min = z_min + FixedPoint::from(-zeta);
    }

    // Substituting ze = z_min into the invariant gives the terminal bond
    // reserves y' = (k - (c / mu) * (mu * z_min)^(1 - t))^(1 / (1 - t)).
    let one = FixedPoint::one();
    let k = k_down(ze, y, c, mu, t);
    let floor_term = c.mul_div_up(mu.mul_up(z_min).pow(one - t), mu);
    if k < floor_term {
        return Err(CoreError::InsufficientLiquidity);
    }
    let optimal_y = invert_exponent_down(k - floor_term, t);

    if optimal_y >= y {
        Ok(optimal_y - y)
    } else {
        Err(CoreError::InsufficientLiquidity)
    }
}

/// State that exposes curve parameters. Implemented by the pool snapshot so
/// the solvers can be called directly on it.
pub trait YieldSpace {
    /// The share reserves.
    fn z(&self) -> FixedPoint;

    /// The share adjustment.
    fn zeta(&self) -> I256;

    /// The bond reserves.
    fn y(&self) -> FixedPoint;

    /// The current vault share price.
    fn c(&self) -> FixedPoint;

    /// The initial vault share price.
    fn mu(&self) -> FixedPoint;

    /// The time-stretch exponent.
    fn t(&self) -> FixedPoint;

    /// The effective (curve-tradeable) share reserves.
    fn ze(&self) -> FixedPoint {
        effective_share_reserves(self.z(), self.zeta())
    }

    fn spot_price(&self) -> FixedPoint {
        spot_price(self.ze(), self.y(), self.mu(), self.t())
    }

    fn bonds_out_given_shares_in_down(&self, dz: FixedPoint) -> CoreResult<FixedPoint> {
        bonds_out_given_shares_in_down(self.ze(), self.y(), self.c(), self.mu(), self.t(), dz)
    }

    fn shares_in_given_bonds_out_up(&self, dy: FixedPoint) -> CoreResult<FixedPoint> {
        shares_in_given_bonds_out_up(self.ze(), self.y(), self.c(), self.mu(), self.t(), dy)
    }

    fn shares_in_given_bonds_out_down(&self, dy: FixedPoint) -> CoreResult<FixedPoint> {
        shares_in_given_bonds_out_down(self.ze(), self.y(), self.c(), self.mu(), self.t(), dy)
    }

    fn shares_out_given_bonds_in_down(&self, dy: FixedPoint) -> CoreResult<FixedPoint> {
        shares_out_given_bonds_in_down(self.ze(), self.y(), self.c(), self.mu(), self.t(), dy)
    }

    fn max_buy_shares_in(&self) -> CoreResult<FixedPoint> {
        max_buy_shares_in(self.ze(), self.y(), self.c(), self.mu(), self.t())
    }

    fn max_buy_bonds_out(&self) -> CoreResult<FixedPoint> {
        max_buy_bonds_out(self.ze(), self.y(), self.c(), self.mu(), self.t())
    }

    fn max_sell_bonds_in(&self, z_min: FixedPoint) -> CoreResult<FixedPoint> {
        max_sell_bonds_in(
            self.ze(),
            self.y(),
            self.c(),
            self.mu(),
            self.t(),
            self.zeta(),
            z_min,
        )
    }

    fn k_up(&self) -> FixedPoint {
        k_up(self.ze(), self.y(), self.c(), self.mu(), self.t())
    }

    fn k_down(&self) -> FixedPoint {
        k_down(self.ze(), self.y(), self.c(), self.mu(), self.t())
    }
}
