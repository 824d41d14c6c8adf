//! Butcher tableaux for the adaptive single-step Runge-Kutta family (§4.1).

/// Nodes `c`, strictly-lower-triangular matrix `a`, primary weights `b`, and
/// embedded weights `b_hat` defining one explicit Runge-Kutta pair.
pub struct Tableau {
    pub name: &'static str,
    pub c: Vec<f64>,
    pub a: Vec<Vec<f64>>,
    pub b: Vec<f64>,
    pub b_hat: Vec<f64>,
    /// Order of the primary (advancing) formula.
    pub order: u32,
    pub fsal: bool,
}

impl Tableau {
    pub fn stages(&self) -> usize {
        self.c.len()
    }

    /// Bogacki-Shampine 3(2), FSAL, four stages.
    pub fn bogacki_shampine32() -> Self {
        Tableau {
            name: "bogacki-shampine-3(2)",
            c: vec![0.0, 1.0 / 2.0, 3.0 / 4.0, 1.0],
            a: vec![
                vec![],
                vec![1.0 / 2.0],
                vec![0.0, 3.0 / 4.0],
                vec![2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0],
            ],
            b: vec![2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0, 0.0],
            b_hat: vec![7.0 / 24.0, 1.0 / 4.0, 1.0 / 3.0, 1.0 / 8.0],
            order: 3,
            fsal: true,
        }
    }

    /// Fehlberg 4(5), six stages.
    pub fn fehlberg45() -> Self {
        Tableau {
            name: "fehlberg-4(5)",
            c: vec![0.0, 1.0 / 4.0, 3.0 / 8.0, 12.0 / 13.0, 1.0, 1.0 / 2.0],
            a: vec![
                vec![],
                vec![1.0 / 4.0],
                vec![3.0 / 32.0, 9.0 / 32.0],
                vec![1932.0 / 2197.0, -7200.0 / 2197.0, 7296.0 / 2197.0],
                vec![439.0 / 216.0, -8.0, 3680.0 / 513.0, -845.0 / 4104.0],
                vec![
                    -8.0 / 27.0,
                    2.0,
                    -3544.0 / 2565.0,
                    1859.0 / 4104.0,
                    -11.0 / 40.0,
                ],
            ],
            b: vec![
                25.0 / 216.0,
                0.0,
                1408.0 / 2565.0,
                2197.0 / 4104.0,
                -1.0 / 5.0,
                0.0,
            ],
            b_hat: vec![
                16.0 / 135.0,
                0.0,
                6656.0 / 12825.0,
                28561.0 / 56430.0,
                -9.0 / 50.0,
                2.0 / 55.0,
            ],
            order: 4,
            fsal: false,
        }
    }

    /// Dormand-Prince 5(4), FSAL, seven stages.
    pub fn dormand_prince54() -> Self {
        Tableau {
            name: "dormand-prince-5(4)",
            c: vec![0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0],
            a: vec![
                vec![],
                vec![1.0 / 5.0],
                vec![3.0 / 40.0, 9.0 / 40.0],
                vec![44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
                vec![
                    19372.0 / 6561.0,
                    -25360.0 / 2187.0,
                    64448.0 / 6561.0,
                    -212.0 / 729.0,
                ],
                vec![
                    9017.0 / 3168.0,
                    -355.0 / 33.0,
                    46732.0 / 5247.0,
                    49.0 / 176.0,
                    -5103.0 / 18656.0,
                ],
                vec![
                    35.0 / 384.0,
                    0.0,
                    500.0 / 1113.0,
                    125.0 / 192.0,
                    -2187.0 / 6784.0,
                    11.0 / 84.0,
                ],
            ],
            b: vec![
                35.0 / 384.0,
                0.0,
                500.0 / 1113.0,
                125.0 / 192.0,
                -2187.0 / 6784.0,
                11.0 / 84.0,
                0.0,
            ],
            b_hat: vec![
                5179.0 / 57600.0,
                0.0,
                7571.0 / 16695.0,
                393.0 / 640.0,
                -92097.0 / 339200.0,
                187.0 / 2100.0,
                1.0 / 40.0,
            ],
            order: 5,
            fsal: true,
        }
    }
}
