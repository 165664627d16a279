// SPDX-FileCopyrightText: 2023 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

use crate::machine_state::csregisters::Privilege;

/// Modes the hart can be in when running code
#[derive(Debug, PartialEq, PartialOrd, Eq, Copy, Clone, strum::EnumIter)]
#[repr(u8)]
pub enum Mode {
    User = 0b00,
    Supervisor = 0b01,
    Machine = 0b11,
}

impl Mode {
    /// Obtain the corresponding [`Privilege`] for [`Mode`].
    pub fn privilege(&self) -> Privilege {
        match self {
            Mode::User => Privilege::Unprivileged,
            Mode::Supervisor => Privilege::Supervisor,
            Mode::Machine => Privilege::Machine,
        }
    }
}

impl TryFrom<u8> for Mode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Mode::User),
            1 => Ok(Mode::Supervisor),
            3 => Ok(Mode::Machine),
            _ => Err(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Mode;
    use strum::IntoEnumIterator;

    #[test]
    fn test_mode_round_trip() {
        Mode::iter().for_each(|mode| {
            assert_eq!(Mode::try_from(mode as u8), Ok(mode));
        });
        assert_eq!(Mode::try_from(2), Err(2));
        assert_eq!(Mode::try_from(42), Err(42));
    }
}
